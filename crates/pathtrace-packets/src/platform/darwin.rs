//! macOS ICMP ingress/egress over DGRAM ping sockets.
//!
//! The platform forbids raw ICMP to unprivileged processes, so the socket is
//! created with `SOCK_DGRAM` through a direct system call. When an interface
//! is configured, `IP_BOUND_IF`/`IPV6_BOUND_IF` is applied before binding the
//! source address; only then is the descriptor adopted by the socket wrapper.

use crate::platform::sockets::{IcmpSocketSource, RawProbeSink};
use crate::platform::EndpointConfig;
use crate::sink::ProbeSink;
use crate::source::PacketSource;
use pathtrace_core::TraceError;
use socket2::Socket;
use std::ffi::CString;
use std::net::IpAddr;
use std::os::fd::FromRawFd;
use std::sync::Arc;
use std::time::Duration;

fn last_error() -> std::io::Error {
    std::io::Error::last_os_error()
}

fn interface_index(name: &str) -> Result<libc::c_uint, TraceError> {
    let cname = CString::new(name).map_err(|_| TraceError::InvalidSourceAddress {
        addr: name.to_string(),
        reason: "interface name contains a NUL byte".to_string(),
    })?;
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if index == 0 {
        return Err(TraceError::InvalidSourceAddress {
            addr: name.to_string(),
            reason: "unknown network interface".to_string(),
        });
    }
    Ok(index)
}

/// Creates a DGRAM ICMP ping socket bound to `src`, optionally pinned to an
/// interface first.
fn open_dgram_icmp(src: IpAddr, interface: Option<&str>) -> Result<Socket, TraceError> {
    let v6 = src.is_ipv6();
    let (af, proto) = if v6 {
        (libc::AF_INET6, libc::IPPROTO_ICMPV6)
    } else {
        (libc::AF_INET, libc::IPPROTO_ICMP)
    };

    let fd = unsafe { libc::socket(af, libc::SOCK_DGRAM, proto) };
    if fd < 0 {
        return Err(TraceError::SocketCreation(last_error()));
    }
    // Adopt the fd immediately so error paths below close it.
    let socket = unsafe { Socket::from_raw_fd(fd) };
    socket
        .set_cloexec(true)
        .map_err(TraceError::SocketCreation)?;

    if let Some(name) = interface {
        let index = interface_index(name)? as libc::c_int;
        let (level, option) = if v6 {
            (libc::IPPROTO_IPV6, libc::IPV6_BOUND_IF)
        } else {
            (libc::IPPROTO_IP, libc::IP_BOUND_IF)
        };
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                option,
                &index as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(TraceError::SocketCreation(last_error()));
        }
    }

    socket
        .bind(&std::net::SocketAddr::new(src, 0).into())
        .map_err(|source| TraceError::SocketBind { addr: src, source })?;
    socket
        .set_read_timeout(Some(Duration::from_millis(100)))
        .map_err(TraceError::SocketCreation)?;

    Ok(socket)
}

pub fn open_icmp_ingress(
    cfg: &EndpointConfig,
) -> Result<Arc<dyn PacketSource>, TraceError> {
    let socket = open_dgram_icmp(cfg.src, cfg.interface.as_deref())?;
    socket
        .set_recv_buffer_size(1 << 20)
        .map_err(TraceError::SocketCreation)?;
    // macOS delivers the IPv4 header on DGRAM ICMP reads; only ICMPv6 reads
    // start at the ICMP header.
    Ok(Arc::new(IcmpSocketSource::from_socket(
        socket,
        cfg.src.is_ipv6(),
    )))
}

pub fn open_icmp_egress(cfg: &EndpointConfig) -> Result<Arc<dyn ProbeSink>, TraceError> {
    let socket = open_dgram_icmp(cfg.src, cfg.interface.as_deref())?;
    Ok(Arc::new(RawProbeSink::from_socket(
        socket,
        cfg.src.is_ipv6(),
    )))
}
