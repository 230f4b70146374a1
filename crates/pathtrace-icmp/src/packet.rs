//! ICMP echo request construction using pnet.

use pathtrace_core::TraceError;
use pnet_packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet_packet::icmp::{IcmpCode, IcmpPacket, IcmpType, IcmpTypes};
use pnet_packet::icmpv6::Icmpv6Packet;
use std::net::Ipv6Addr;

/// Echo header size (type, code, checksum, identifier, sequence).
pub const ECHO_HEADER_LEN: usize = 8;

const ICMPV6_ECHO_REQUEST: u8 = 128;

/// Builds an ICMPv4 Echo Request message (no IP header; the kernel adds it).
pub fn echo_request_v4(
    ident: u16,
    seq: u16,
    payload_len: usize,
) -> Result<Vec<u8>, TraceError> {
    let mut buffer = fill_echo(IcmpTypes::EchoRequest, ident, seq, payload_len)?;

    let view = IcmpPacket::new(&buffer)
        .ok_or_else(|| TraceError::Internal("echo buffer too small".to_string()))?;
    let checksum = pnet_packet::icmp::checksum(&view);
    buffer[2..4].copy_from_slice(&checksum.to_be_bytes());
    Ok(buffer)
}

/// Builds an ICMPv6 Echo Request message.
///
/// The checksum covers the IPv6 pseudo-header, so both addresses are needed
/// even though the kernel supplies the IP header itself.
pub fn echo_request_v6(
    ident: u16,
    seq: u16,
    payload_len: usize,
    src: Ipv6Addr,
    dst: Ipv6Addr,
) -> Result<Vec<u8>, TraceError> {
    let mut buffer = fill_echo(IcmpType::new(ICMPV6_ECHO_REQUEST), ident, seq, payload_len)?;

    let view = Icmpv6Packet::new(&buffer)
        .ok_or_else(|| TraceError::Internal("echo buffer too small".to_string()))?;
    let checksum = pnet_packet::icmpv6::checksum(&view, &src, &dst);
    buffer[2..4].copy_from_slice(&checksum.to_be_bytes());
    Ok(buffer)
}

fn fill_echo(
    icmp_type: IcmpType,
    ident: u16,
    seq: u16,
    payload_len: usize,
) -> Result<Vec<u8>, TraceError> {
    let mut buffer = vec![0u8; ECHO_HEADER_LEN + payload_len];
    {
        let mut packet = MutableEchoRequestPacket::new(&mut buffer)
            .ok_or_else(|| TraceError::Internal("echo buffer too small".to_string()))?;
        packet.set_icmp_type(icmp_type);
        packet.set_icmp_code(IcmpCode::new(0));
        packet.set_identifier(ident);
        packet.set_sequence_number(seq);
        let fill: Vec<u8> = (0..payload_len).map(|i| (i & 0xFF) as u8).collect();
        packet.set_payload(&fill);
    }
    Ok(buffer)
}
