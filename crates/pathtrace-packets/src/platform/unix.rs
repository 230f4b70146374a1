//! Unix backend constructors over raw sockets.

#[cfg(not(target_os = "macos"))]
use crate::platform::sockets::IcmpSocketSource;
use crate::platform::sockets::{RawProbeSink, RawTcpChannel};
use crate::platform::EndpointConfig;
use crate::sink::{ProbeSink, TcpChannel};
use crate::source::PacketSource;
use pathtrace_core::TraceError;
use std::sync::Arc;

#[cfg(not(target_os = "macos"))]
pub fn open_icmp_ingress(cfg: &EndpointConfig) -> Result<Arc<dyn PacketSource>, TraceError> {
    Ok(Arc::new(IcmpSocketSource::open(cfg.src)?))
}

#[cfg(not(target_os = "macos"))]
pub fn open_icmp_egress(cfg: &EndpointConfig) -> Result<Arc<dyn ProbeSink>, TraceError> {
    Ok(Arc::new(RawProbeSink::icmp(cfg.src)?))
}

pub fn open_udp_egress(cfg: &EndpointConfig) -> Result<Arc<dyn ProbeSink>, TraceError> {
    Ok(Arc::new(RawProbeSink::udp(cfg.src)?))
}

pub fn open_tcp_channel(cfg: &EndpointConfig) -> Result<Arc<dyn TcpChannel>, TraceError> {
    Ok(Arc::new(RawTcpChannel::open(cfg.src, cfg.dest)?))
}
