//! Platform-specific packet I/O backends.
//!
//! Everything above this module works against the [`PacketSource`],
//! [`ProbeSink`] and [`TcpChannel`] traits; the constructors here are the
//! only place the platform is consulted.

pub mod sockets;

#[cfg(unix)]
pub mod unix;

#[cfg(target_os = "macos")]
pub mod darwin;

#[cfg(windows)]
pub mod windows;

use crate::sink::{ProbeSink, TcpChannel};
use crate::source::PacketSource;
use pathtrace_core::{IcmpMode, TraceError};
use std::net::IpAddr;
use std::sync::Arc;

/// Addressing parameters shared by the backend constructors.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Local address the endpoints bind to.
    pub src: IpAddr,
    /// Trace destination.
    pub dest: IpAddr,
    /// Destination port (TCP capture filter).
    pub dest_port: u16,
    /// Interface to bind to, when the platform needs one.
    pub interface: Option<String>,
    /// Windows ICMP ingress selection hint.
    pub icmp_mode: IcmpMode,
}

/// Opens the ICMP ingress endpoint for this platform.
pub fn open_icmp_ingress(cfg: &EndpointConfig) -> Result<Arc<dyn PacketSource>, TraceError> {
    #[cfg(target_os = "macos")]
    return darwin::open_icmp_ingress(cfg);

    #[cfg(all(unix, not(target_os = "macos")))]
    return unix::open_icmp_ingress(cfg);

    #[cfg(windows)]
    return windows::open_icmp_ingress(cfg);

    #[allow(unreachable_code)]
    Err(TraceError::Internal("unsupported platform".to_string()))
}

/// Opens the ICMP egress endpoint for this platform.
pub fn open_icmp_egress(cfg: &EndpointConfig) -> Result<Arc<dyn ProbeSink>, TraceError> {
    #[cfg(target_os = "macos")]
    return darwin::open_icmp_egress(cfg);

    #[cfg(all(unix, not(target_os = "macos")))]
    return unix::open_icmp_egress(cfg);

    #[cfg(windows)]
    return windows::open_icmp_egress(cfg);

    #[allow(unreachable_code)]
    Err(TraceError::Internal("unsupported platform".to_string()))
}

/// Opens the UDP egress endpoint for this platform.
pub fn open_udp_egress(cfg: &EndpointConfig) -> Result<Arc<dyn ProbeSink>, TraceError> {
    #[cfg(unix)]
    return unix::open_udp_egress(cfg);

    #[cfg(windows)]
    return windows::open_udp_egress(cfg);

    #[allow(unreachable_code)]
    Err(TraceError::Internal("unsupported platform".to_string()))
}

/// Opens the TCP probe channel for this platform.
pub fn open_tcp_channel(cfg: &EndpointConfig) -> Result<Arc<dyn TcpChannel>, TraceError> {
    #[cfg(unix)]
    return unix::open_tcp_channel(cfg);

    #[cfg(windows)]
    return windows::open_tcp_channel(cfg);

    #[allow(unreachable_code)]
    Err(TraceError::Internal("unsupported platform".to_string()))
}
