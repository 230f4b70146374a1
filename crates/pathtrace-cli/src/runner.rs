//! Trace facade: resolves addresses, opens the platform endpoints and
//! dispatches to the tracer variant for the chosen method.

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use pathtrace_core::{Method, TraceConfig, TraceError, TraceResult};
use pathtrace_icmp::IcmpTracer;
use pathtrace_packets::platform::{self, EndpointConfig};
use pathtrace_tcp::TcpTracer;
use pathtrace_udp::UdpTracer;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::debug;

/// Resolves a hostname or literal IP, preferring the requested family.
pub async fn resolve_host(host: &str, want_v6: bool) -> Result<IpAddr, TraceError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
    let lookup = resolver
        .lookup_ip(host)
        .await
        .map_err(|e| TraceError::ResolveFailed {
            hostname: host.to_string(),
            reason: e.to_string(),
        })?;

    lookup
        .iter()
        .find(|ip| ip.is_ipv6() == want_v6)
        .or_else(|| lookup.iter().next())
        .ok_or_else(|| TraceError::ResolveFailed {
            hostname: host.to_string(),
            reason: "no addresses found".to_string(),
        })
}

/// Determines the local address used to reach `target` by connecting a
/// throwaway UDP socket.
pub fn local_addr_for(target: IpAddr) -> Result<IpAddr, TraceError> {
    let socket = match target {
        IpAddr::V4(_) => std::net::UdpSocket::bind("0.0.0.0:0"),
        IpAddr::V6(_) => std::net::UdpSocket::bind("[::]:0"),
    }
    .map_err(TraceError::SocketCreation)?;
    socket
        .connect(SocketAddr::new(target, 33494))
        .map_err(TraceError::SocketCreation)?;
    socket
        .local_addr()
        .map(|addr| addr.ip())
        .map_err(TraceError::SocketCreation)
}

/// Reserves an ephemeral local port.
pub fn allocate_port(v6: bool) -> Result<u16, TraceError> {
    let socket = if v6 {
        std::net::UdpSocket::bind("[::]:0")
    } else {
        std::net::UdpSocket::bind("0.0.0.0:0")
    }
    .map_err(TraceError::SocketCreation)?;
    socket
        .local_addr()
        .map(|addr| addr.port())
        .map_err(TraceError::SocketCreation)
}

/// Runs a trace with `method`.
///
/// The result is returned alongside the outcome: a cancelled or faulted run
/// still hands back whatever hops it recorded (truncated by the scheduler),
/// so callers can render the partial trace before surfacing the error. Only
/// setup failures yield an empty result.
pub async fn run_trace(
    method: Method,
    config: TraceConfig,
) -> (Arc<TraceResult>, Result<(), TraceError>) {
    match dispatch_trace(method, config).await {
        Ok(pair) => pair,
        Err(err) => (Arc::new(TraceResult::new()), Err(err)),
    }
}

/// Resolves addresses, opens the platform endpoints and runs the variant for
/// `method`. Errors out only before a tracer exists; once one runs, its
/// result and outcome travel together.
async fn dispatch_trace(
    method: Method,
    mut config: TraceConfig,
) -> Result<(Arc<TraceResult>, Result<(), TraceError>), TraceError> {
    config.normalize(method);

    if config.src_addr.is_none() {
        config.src_addr = Some(local_addr_for(config.dest_ip)?);
    }
    // A configured source port wins over ephemeral allocation.
    if method == Method::Tcp && config.src_port == 0 {
        config.src_port = allocate_port(config.dest_ip.is_ipv6())?;
    }
    config.validate()?;

    let endpoints = EndpointConfig {
        src: config.src_addr.unwrap_or(config.dest_ip),
        dest: config.dest_ip,
        dest_port: config.dest_port,
        interface: config.interface.clone(),
        icmp_mode: config.icmp_mode,
    };
    debug!(method = %method, src = %endpoints.src, dest = %endpoints.dest, "dispatching trace");

    match method {
        Method::Icmp => {
            let ingress = platform::open_icmp_ingress(&endpoints)?;
            let egress = platform::open_icmp_egress(&endpoints)?;
            let tracer = IcmpTracer::new(config, ingress, egress);
            let outcome = tracer.trace().await;
            Ok((tracer.result(), outcome))
        }
        Method::Udp => {
            let ingress = platform::open_icmp_ingress(&endpoints)?;
            let egress = platform::open_udp_egress(&endpoints)?;
            let tracer = UdpTracer::new(config, ingress, egress);
            let outcome = tracer.trace().await;
            Ok((tracer.result(), outcome))
        }
        Method::Tcp => {
            let ingress = platform::open_icmp_ingress(&endpoints)?;
            let channel = platform::open_tcp_channel(&endpoints)?;
            let tracer = TcpTracer::new(config, ingress, channel);
            let outcome = tracer.trace().await;
            Ok((tracer.result(), outcome))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal_ip() {
        let ip = resolve_host("93.184.216.34", false).await.unwrap();
        assert_eq!(ip, "93.184.216.34".parse::<IpAddr>().unwrap());

        let ip6 = resolve_host("2606:2800:220:1::1", true).await.unwrap();
        assert!(ip6.is_ipv6());
    }

    #[test]
    fn test_allocate_port_is_nonzero() {
        let port = allocate_port(false).unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn test_local_addr_family_matches() {
        let addr = local_addr_for("127.0.0.1".parse().unwrap()).unwrap();
        assert!(addr.is_ipv4());
    }

    #[tokio::test]
    async fn test_setup_failure_returns_empty_result_with_error() {
        let mut cfg = TraceConfig::new("127.0.0.1".parse().unwrap());
        cfg.begin_hop = 0; // rejected before any endpoint opens
        let (result, outcome) = run_trace(Method::Icmp, cfg).await;
        assert!(result.is_empty());
        assert!(matches!(outcome, Err(TraceError::InvalidHopRange { .. })));
    }
}
