//! Packet egress traits.

use crate::source::PacketSource;
use std::net::IpAddr;
use std::time::Instant;

/// Datagram egress for ICMP and UDP probes.
///
/// Implementations set the TTL/hop limit and write the packet under one
/// internal lock, so no concurrent probe can observe a TTL set by another.
/// The returned instant is taken between the option set and the write; the
/// per-probe timeout starts from it.
pub trait ProbeSink: Send + Sync {
    fn send(&self, packet: &[u8], dst: IpAddr, ttl: u8) -> std::io::Result<Instant>;

    fn close(&self) -> std::io::Result<()>;
}

/// Combined SYN egress and reply ingress for TCP probes.
///
/// `send_syn` takes the serialized TCP segment (no IP header); backends that
/// inject whole frames wrap it themselves. The same set-TTL-then-write lock
/// discipline as [`ProbeSink`] applies.
pub trait TcpChannel: PacketSource {
    fn send_syn(&self, segment: &[u8], ttl: u8) -> std::io::Result<Instant>;
}
