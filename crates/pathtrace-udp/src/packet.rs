//! UDP probe construction and sequence encoding.
//!
//! IPv4 probes travel as full datagrams (header-included socket) so the
//! Identification field can carry the sequence; the quoted header in an ICMP
//! error brings it back unchanged. IPv6 has no such field, so the sequence
//! rides on the destination port offset instead. Either way the payload's
//! first two bytes repeat `(ttl, attempt)` for parsers that see past the
//! quoted UDP header.

use pathtrace_core::{SeqKey, TraceError};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::{Ipv4Flags, MutableIpv4Packet};
use pnet_packet::udp::MutableUdpPacket;
use std::net::{Ipv4Addr, Ipv6Addr};

const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// Maps `(ttl, attempt)` onto the wire fields of a UDP probe and back.
#[derive(Debug, Clone, Copy)]
pub struct UdpSeqCodec {
    v6: bool,
    base_port: u16,
    max_attempts: u16,
}

impl UdpSeqCodec {
    pub fn new(v6: bool, base_port: u16, max_attempts: usize) -> Self {
        Self {
            v6,
            base_port,
            max_attempts: max_attempts.clamp(1, 255) as u16,
        }
    }

    /// The registry key for a probe.
    pub fn key(&self, ttl: u8, attempt: u8) -> SeqKey {
        ((ttl as SeqKey) << 8) | attempt as SeqKey
    }

    /// Destination port the probe is sent to.
    pub fn dest_port(&self, ttl: u8, attempt: u8) -> u16 {
        if self.v6 {
            // max_attempts is clamped to 255, so the offset itself fits u16;
            // only the base may wrap, and decoding wraps the same way.
            self.base_port
                .wrapping_add(ttl as u16 * self.max_attempts + attempt as u16)
        } else {
            self.base_port
        }
    }

    /// IPv4 Identification field of the probe.
    pub fn ip_id(&self, ttl: u8, attempt: u8) -> u16 {
        self.key(ttl, attempt) as u16
    }

    /// Recovers the registry key from a quoted IPv4 Identification field.
    pub fn key_from_ip_id(&self, ip_id: u16) -> SeqKey {
        ip_id as SeqKey
    }

    /// Recovers the registry key from a quoted destination port (IPv6).
    pub fn key_from_port(&self, port: u16) -> Option<SeqKey> {
        let offset = port.wrapping_sub(self.base_port);
        let ttl = offset / self.max_attempts;
        let attempt = offset % self.max_attempts;
        if ttl == 0 || ttl > 255 {
            return None;
        }
        Some(((ttl as SeqKey) << 8) | attempt as SeqKey)
    }
}

fn probe_payload(ttl: u8, attempt: u8, payload_len: usize) -> Vec<u8> {
    // UDP payloads are normalized to at least two bytes.
    let payload_len = payload_len.max(2);
    let mut payload = vec![0u8; payload_len];
    payload[0] = ttl;
    payload[1] = attempt;
    for (i, byte) in payload.iter_mut().enumerate().skip(2) {
        *byte = (i & 0xFF) as u8;
    }
    payload
}

/// Builds a full IPv4 UDP probe datagram.
#[allow(clippy::too_many_arguments)]
pub fn udp_probe_v4(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    ip_id: u16,
    ttl: u8,
    attempt: u8,
    payload_len: usize,
) -> Result<Vec<u8>, TraceError> {
    let payload = probe_payload(ttl, attempt, payload_len);
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    let mut buffer = vec![0u8; total_len];

    {
        let mut ip = MutableIpv4Packet::new(&mut buffer)
            .ok_or_else(|| TraceError::Internal("UDP probe buffer too small".to_string()))?;
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length(total_len as u16);
        ip.set_identification(ip_id);
        ip.set_flags(Ipv4Flags::DontFragment);
        ip.set_ttl(ttl);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ip.set_source(src);
        ip.set_destination(dst);
        let checksum = pnet_packet::ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);
    }

    {
        let mut udp = MutableUdpPacket::new(&mut buffer[IPV4_HEADER_LEN..])
            .ok_or_else(|| TraceError::Internal("UDP probe buffer too small".to_string()))?;
        udp.set_source(src_port);
        udp.set_destination(dst_port);
        udp.set_length(udp_len as u16);
        udp.set_payload(&payload);
        let checksum = pnet_packet::udp::ipv4_checksum(&udp.to_immutable(), &src, &dst);
        udp.set_checksum(checksum);
    }

    Ok(buffer)
}

/// Builds an IPv6 UDP probe segment (the kernel adds the IP header).
pub fn udp_segment_v6(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    ttl: u8,
    attempt: u8,
    payload_len: usize,
) -> Result<Vec<u8>, TraceError> {
    let payload = probe_payload(ttl, attempt, payload_len);
    let udp_len = UDP_HEADER_LEN + payload.len();
    let mut buffer = vec![0u8; udp_len];

    let mut udp = MutableUdpPacket::new(&mut buffer)
        .ok_or_else(|| TraceError::Internal("UDP probe buffer too small".to_string()))?;
    udp.set_source(src_port);
    udp.set_destination(dst_port);
    udp.set_length(udp_len as u16);
    udp.set_payload(&payload);
    let checksum = pnet_packet::udp::ipv6_checksum(&udp.to_immutable(), &src, &dst);
    udp.set_checksum(checksum);

    Ok(buffer)
}
