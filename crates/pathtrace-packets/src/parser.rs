//! Inbound frame parsing.
//!
//! Classifies ICMP messages, pulls the quoted probe out of error payloads,
//! decodes MPLS extension stacks (RFC 4884 / RFC 4950) and parses TCP
//! handshake replies. Anything malformed yields `None`; read loops drop such
//! frames without affecting the run.

use crate::source::Framing;
use pathtrace_core::MplsLabel;
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::TcpPacket;
use std::net::IpAddr;

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_ICMPV6: u8 = 58;

const ICMP_HEADER_LEN: usize = 8;
const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV4_DEST_UNREACHABLE: u8 = 3;
const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_TIME_EXCEEDED: u8 = 11;

const ICMPV6_DEST_UNREACHABLE: u8 = 1;
const ICMPV6_PACKET_TOO_BIG: u8 = 2;
const ICMPV6_TIME_EXCEEDED: u8 = 3;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

// ICMP extension structure (RFC 4884, RFC 4950)
const ICMP_EXT_VERSION: u8 = 2;
const MPLS_LABEL_STACK_CLASS: u8 = 1;
const MPLS_LABEL_STACK_TYPE: u8 = 1;
const LEGACY_ORIGINAL_DATAGRAM_LEN: usize = 128;

/// Classification of an inbound ICMP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IcmpKind {
    TimeExceeded,
    DestUnreachable,
    /// IPv6 only.
    PacketTooBig,
    /// Identifier and sequence from the reply's own header.
    EchoReply { ident: u16, seq: u16 },
}

/// The probe a router quoted inside an ICMP error.
#[derive(Debug, Clone)]
pub struct QuotedProbe {
    /// Source of the original probe.
    pub src: IpAddr,
    /// Destination of the original probe.
    pub dst: IpAddr,
    /// IPv4 Identification field of the quoted header; 0 for IPv6.
    pub ip_id: u16,
    /// Transport protocol of the quoted packet.
    pub protocol: u8,
    /// Quoted transport header (at least 8 bytes).
    pub transport: Vec<u8>,
}

/// Parsed ICMP message, ready for correlation.
#[derive(Debug, Clone)]
pub struct IcmpEnvelope {
    pub kind: IcmpKind,
    /// Present for the error kinds, absent for echo replies.
    pub quoted: Option<QuotedProbe>,
    pub mpls: Option<Vec<MplsLabel>>,
}

/// Parses one inbound frame into an ICMP envelope.
///
/// `framing` states whether `data` starts at the IP or the ICMP header; `v6`
/// selects the ICMP dialect when no IP header is present to tell.
pub fn parse_icmp_frame(
    data: &[u8],
    framing: Framing,
    v6: bool,
    want_mpls: bool,
) -> Option<IcmpEnvelope> {
    let icmp = match framing {
        Framing::Ip => strip_ip_header(data, v6, if v6 { IPPROTO_ICMPV6 } else { IPPROTO_ICMP })?,
        Framing::Transport => data,
    };
    if icmp.len() < ICMP_HEADER_LEN {
        return None;
    }

    if v6 {
        parse_icmpv6(icmp, want_mpls)
    } else {
        parse_icmpv4(icmp, want_mpls)
    }
}

fn strip_ip_header<'a>(data: &'a [u8], v6: bool, protocol: u8) -> Option<&'a [u8]> {
    if v6 {
        if data.len() < IPV6_HEADER_LEN || data[0] >> 4 != 6 {
            return None;
        }
        let ip = Ipv6Packet::new(data)?;
        if ip.get_next_header().0 != protocol {
            return None;
        }
        Some(&data[IPV6_HEADER_LEN..])
    } else {
        if data.len() < IPV4_MIN_HEADER_LEN || data[0] >> 4 != 4 {
            return None;
        }
        let ip = Ipv4Packet::new(data)?;
        if ip.get_next_level_protocol().0 != protocol {
            return None;
        }
        let header_len = ip.get_header_length() as usize * 4;
        if header_len < IPV4_MIN_HEADER_LEN || data.len() < header_len {
            return None;
        }
        Some(&data[header_len..])
    }
}

fn parse_icmpv4(icmp: &[u8], want_mpls: bool) -> Option<IcmpEnvelope> {
    match icmp[0] {
        ICMPV4_ECHO_REPLY => Some(IcmpEnvelope {
            kind: IcmpKind::EchoReply {
                ident: u16::from_be_bytes([icmp[4], icmp[5]]),
                seq: u16::from_be_bytes([icmp[6], icmp[7]]),
            },
            quoted: None,
            mpls: None,
        }),
        ICMPV4_TIME_EXCEEDED => parse_error(icmp, IcmpKind::TimeExceeded, false, want_mpls),
        ICMPV4_DEST_UNREACHABLE => parse_error(icmp, IcmpKind::DestUnreachable, false, want_mpls),
        _ => None,
    }
}

fn parse_icmpv6(icmp: &[u8], want_mpls: bool) -> Option<IcmpEnvelope> {
    match icmp[0] {
        ICMPV6_ECHO_REPLY => Some(IcmpEnvelope {
            kind: IcmpKind::EchoReply {
                ident: u16::from_be_bytes([icmp[4], icmp[5]]),
                seq: u16::from_be_bytes([icmp[6], icmp[7]]),
            },
            quoted: None,
            mpls: None,
        }),
        ICMPV6_TIME_EXCEEDED => parse_error(icmp, IcmpKind::TimeExceeded, true, want_mpls),
        ICMPV6_DEST_UNREACHABLE => parse_error(icmp, IcmpKind::DestUnreachable, true, want_mpls),
        ICMPV6_PACKET_TOO_BIG => parse_error(icmp, IcmpKind::PacketTooBig, true, want_mpls),
        _ => None,
    }
}

/// Parses the quoted datagram of an ICMP error message.
///
/// The quoted payload starts after the 8-byte ICMP header and must carry the
/// original IP header plus at least 8 bytes of transport header; a v4 quote
/// below 20 bytes or a v6 quote below 40 is rejected, as is a version nibble
/// that does not match the dialect.
fn parse_error(icmp: &[u8], kind: IcmpKind, v6: bool, want_mpls: bool) -> Option<IcmpEnvelope> {
    let quoted_data = &icmp[ICMP_HEADER_LEN..];

    let quoted = if v6 {
        if quoted_data.len() < IPV6_HEADER_LEN + 8 || quoted_data[0] >> 4 != 6 {
            return None;
        }
        let inner = Ipv6Packet::new(quoted_data)?;
        QuotedProbe {
            src: IpAddr::V6(inner.get_source()),
            dst: IpAddr::V6(inner.get_destination()),
            ip_id: 0,
            protocol: inner.get_next_header().0,
            transport: quoted_data[IPV6_HEADER_LEN..].to_vec(),
        }
    } else {
        if quoted_data.len() < IPV4_MIN_HEADER_LEN + 8 || quoted_data[0] >> 4 != 4 {
            return None;
        }
        let inner = Ipv4Packet::new(quoted_data)?;
        let header_len = inner.get_header_length() as usize * 4;
        if header_len < IPV4_MIN_HEADER_LEN || quoted_data.len() < header_len + 8 {
            return None;
        }
        QuotedProbe {
            src: IpAddr::V4(inner.get_source()),
            dst: IpAddr::V4(inner.get_destination()),
            ip_id: inner.get_identification(),
            protocol: inner.get_next_level_protocol().0,
            transport: quoted_data[header_len..].to_vec(),
        }
    };

    let mpls = if want_mpls {
        parse_mpls_extensions(quoted_data, icmp[5])
    } else {
        None
    };

    Some(IcmpEnvelope {
        kind,
        quoted: Some(quoted),
        mpls,
    })
}

/// Walks the ICMP extension area for an MPLS label stack object.
///
/// The RFC 4884 length field gives the quoted datagram length in 32-bit
/// words; zero means the legacy fixed 128-byte layout.
fn parse_mpls_extensions(quoted_data: &[u8], length_field: u8) -> Option<Vec<MplsLabel>> {
    let ext_start = if length_field > 0 {
        length_field as usize * 4
    } else {
        LEGACY_ORIGINAL_DATAGRAM_LEN
    };

    if quoted_data.len() < ext_start + 4 {
        return None;
    }
    let ext = &quoted_data[ext_start..];

    if (ext[0] >> 4) != ICMP_EXT_VERSION {
        return None;
    }

    let mut offset = 4;
    while offset + 4 <= ext.len() {
        let object_len = u16::from_be_bytes([ext[offset], ext[offset + 1]]) as usize;
        let class = ext[offset + 2];
        let ctype = ext[offset + 3];
        if object_len < 4 || offset + object_len > ext.len() {
            break;
        }

        if class == MPLS_LABEL_STACK_CLASS && ctype == MPLS_LABEL_STACK_TYPE {
            let mut labels = Vec::new();
            for chunk in ext[offset + 4..offset + object_len].chunks_exact(4) {
                let entry = [chunk[0], chunk[1], chunk[2], chunk[3]];
                let label = MplsLabel::from_bytes(&entry);
                let bottom = label.bottom;
                labels.push(label);
                if bottom {
                    break;
                }
            }
            if !labels.is_empty() {
                return Some(labels);
            }
        }

        offset += object_len;
    }

    None
}

/// Identifier and sequence of a quoted echo request.
pub fn quoted_echo(transport: &[u8], v6: bool) -> Option<(u16, u16)> {
    if transport.len() < 8 {
        return None;
    }
    let expected = if v6 {
        ICMPV6_ECHO_REQUEST
    } else {
        ICMPV4_ECHO_REQUEST
    };
    if transport[0] != expected {
        return None;
    }
    Some((
        u16::from_be_bytes([transport[4], transport[5]]),
        u16::from_be_bytes([transport[6], transport[7]]),
    ))
}

/// First 8 bytes of a quoted UDP header.
#[derive(Debug, Clone, Copy)]
pub struct UdpQuote {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

pub fn quoted_udp(transport: &[u8]) -> Option<UdpQuote> {
    if transport.len() < 8 {
        return None;
    }
    Some(UdpQuote {
        src_port: u16::from_be_bytes([transport[0], transport[1]]),
        dst_port: u16::from_be_bytes([transport[2], transport[3]]),
        length: u16::from_be_bytes([transport[4], transport[5]]),
        checksum: u16::from_be_bytes([transport[6], transport[7]]),
    })
}

/// Sequence number of a quoted TCP header.
pub fn quoted_tcp_seq(transport: &[u8]) -> Option<u32> {
    if transport.len() < 8 {
        return None;
    }
    Some(u32::from_be_bytes([
        transport[4],
        transport[5],
        transport[6],
        transport[7],
    ]))
}

/// A TCP handshake reply (SYN-ACK or RST-ACK).
#[derive(Debug, Clone, Copy)]
pub struct TcpReply {
    pub src_port: u16,
    pub dst_port: u16,
    pub ack: u32,
    pub syn: bool,
    pub rst: bool,
    pub is_ack: bool,
}

impl TcpReply {
    pub fn is_syn_ack(&self) -> bool {
        self.is_ack && self.syn
    }

    pub fn is_rst_ack(&self) -> bool {
        self.is_ack && self.rst
    }
}

/// Parses an inbound TCP segment.
pub fn parse_tcp_reply(data: &[u8], framing: Framing, v6: bool) -> Option<TcpReply> {
    let segment = match framing {
        Framing::Ip => strip_ip_header(data, v6, IPPROTO_TCP)?,
        Framing::Transport => data,
    };
    if segment.len() < 20 {
        return None;
    }
    let tcp = TcpPacket::new(segment)?;
    let flags = segment[13];
    Some(TcpReply {
        src_port: tcp.get_source(),
        dst_port: tcp.get_destination(),
        ack: tcp.get_acknowledgement(),
        syn: flags & 0x02 != 0,
        rst: flags & 0x04 != 0,
        is_ack: flags & 0x10 != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    /// IPv4 header with the given protocol, id and addresses.
    fn ipv4_header(protocol: u8, id: u16, src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut header = vec![0u8; 20];
        header[0] = 0x45;
        header[4..6].copy_from_slice(&id.to_be_bytes());
        header[8] = 1; // quoted TTL
        header[9] = protocol;
        header[12..16].copy_from_slice(&src);
        header[16..20].copy_from_slice(&dst);
        header
    }

    /// ICMPv4 Time Exceeded quoting an echo request.
    fn time_exceeded_quoting_echo(ident: u16, seq: u16) -> Vec<u8> {
        let mut frame = ipv4_header(IPPROTO_ICMP, 0, [192, 168, 0, 1], [192, 168, 0, 2]);
        let mut icmp = vec![0u8; 8];
        icmp[0] = ICMPV4_TIME_EXCEEDED;
        frame.extend_from_slice(&icmp);
        frame.extend_from_slice(&ipv4_header(
            IPPROTO_ICMP,
            0,
            [192, 168, 0, 2],
            [93, 184, 216, 34],
        ));
        let mut echo = vec![0u8; 8];
        echo[0] = ICMPV4_ECHO_REQUEST;
        echo[4..6].copy_from_slice(&ident.to_be_bytes());
        echo[6..8].copy_from_slice(&seq.to_be_bytes());
        frame.extend_from_slice(&echo);
        frame
    }

    #[test]
    fn test_time_exceeded_envelope() {
        let frame = time_exceeded_quoting_echo(0xABCD, 0x0502);
        let env = parse_icmp_frame(&frame, Framing::Ip, false, true).unwrap();
        assert_eq!(env.kind, IcmpKind::TimeExceeded);

        let quoted = env.quoted.unwrap();
        assert_eq!(quoted.dst, IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(quoted.protocol, IPPROTO_ICMP);

        let (ident, seq) = quoted_echo(&quoted.transport, false).unwrap();
        assert_eq!(ident, 0xABCD);
        assert_eq!(seq, 0x0502);
    }

    #[test]
    fn test_echo_reply_envelope() {
        let mut frame = ipv4_header(IPPROTO_ICMP, 0, [93, 184, 216, 34], [192, 168, 0, 2]);
        let mut icmp = vec![0u8; 8];
        icmp[0] = ICMPV4_ECHO_REPLY;
        icmp[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
        icmp[6..8].copy_from_slice(&0x0301u16.to_be_bytes());
        frame.extend_from_slice(&icmp);

        let env = parse_icmp_frame(&frame, Framing::Ip, false, false).unwrap();
        assert_eq!(
            env.kind,
            IcmpKind::EchoReply {
                ident: 0x1234,
                seq: 0x0301
            }
        );
        assert!(env.quoted.is_none());
    }

    #[test]
    fn test_bare_icmpv6_time_exceeded() {
        // ICMPv6 delivered without an IP header, quoting a TCP probe.
        let mut icmp = vec![0u8; 8];
        icmp[0] = ICMPV6_TIME_EXCEEDED;
        let mut inner = vec![0u8; 40];
        inner[0] = 0x60;
        inner[6] = IPPROTO_TCP;
        inner[24..40].copy_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        icmp.extend_from_slice(&inner);
        let mut tcp = vec![0u8; 20];
        tcp[4..8].copy_from_slice(&0x0800_0002u32.to_be_bytes());
        icmp.extend_from_slice(&tcp);

        let env = parse_icmp_frame(&icmp, Framing::Transport, true, false).unwrap();
        assert_eq!(env.kind, IcmpKind::TimeExceeded);
        let quoted = env.quoted.unwrap();
        assert_eq!(quoted.dst, "::1".parse::<IpAddr>().unwrap());
        assert_eq!(quoted_tcp_seq(&quoted.transport), Some(0x0800_0002));
    }

    #[test]
    fn test_short_quote_rejected() {
        let mut frame = ipv4_header(IPPROTO_ICMP, 0, [10, 0, 0, 1], [10, 0, 0, 2]);
        let mut icmp = vec![0u8; 8];
        icmp[0] = ICMPV4_TIME_EXCEEDED;
        frame.extend_from_slice(&icmp);
        frame.extend_from_slice(&[0x45, 0, 0, 0]); // truncated quote
        assert!(parse_icmp_frame(&frame, Framing::Ip, false, false).is_none());
    }

    #[test]
    fn test_version_nibble_mismatch_rejected() {
        let mut icmp = vec![0u8; 8];
        icmp[0] = ICMPV6_TIME_EXCEEDED;
        // quoted bytes claim IPv4 inside an ICMPv6 error
        icmp.extend_from_slice(&vec![0x45; 48]);
        assert!(parse_icmp_frame(&icmp, Framing::Transport, true, false).is_none());
    }

    #[test]
    fn test_quoted_udp_fields() {
        let buf = [0x00, 0x50, 0x82, 0x9A, 0x00, 0x10, 0x12, 0x34];
        let info = quoted_udp(&buf).unwrap();
        assert_eq!(info.src_port, 80);
        assert_eq!(info.dst_port, 33434);
        assert_eq!(info.length, 16);
        assert_eq!(info.checksum, 0x1234);
    }

    #[test]
    fn test_mpls_extension_stack() {
        let ident = 0x0101u16;
        let seq = 0x0100u16;
        // Build a Time Exceeded whose quoted datagram is padded to 128 bytes
        // (legacy layout), followed by an extension header with one MPLS
        // label stack object of two entries.
        let mut icmp = vec![0u8; 8];
        icmp[0] = ICMPV4_TIME_EXCEEDED;

        let mut quoted = ipv4_header(IPPROTO_ICMP, 0, [10, 0, 0, 2], [93, 184, 216, 34]);
        let mut echo = vec![0u8; 8];
        echo[0] = ICMPV4_ECHO_REQUEST;
        echo[4..6].copy_from_slice(&ident.to_be_bytes());
        echo[6..8].copy_from_slice(&seq.to_be_bytes());
        quoted.extend_from_slice(&echo);
        quoted.resize(LEGACY_ORIGINAL_DATAGRAM_LEN, 0);

        let mut ext = vec![0u8; 4];
        ext[0] = ICMP_EXT_VERSION << 4;
        let top: u32 = (0x1F00A << 12) | (2 << 9) | 63;
        let bottom: u32 = (0x1F00B << 12) | (1 << 8) | 62;
        let object_len: u16 = 4 + 8;
        ext.extend_from_slice(&object_len.to_be_bytes());
        ext.push(MPLS_LABEL_STACK_CLASS);
        ext.push(MPLS_LABEL_STACK_TYPE);
        ext.extend_from_slice(&top.to_be_bytes());
        ext.extend_from_slice(&bottom.to_be_bytes());

        icmp.extend_from_slice(&quoted);
        icmp.extend_from_slice(&ext);

        let env = parse_icmp_frame(&icmp, Framing::Transport, false, true).unwrap();
        let labels = env.mpls.unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].label, 0x1F00A);
        assert_eq!(labels[0].tc, 2);
        assert!(!labels[0].bottom);
        assert_eq!(labels[1].label, 0x1F00B);
        assert!(labels[1].bottom);
        assert_eq!(labels[1].ttl, 62);
    }

    #[test]
    fn test_mpls_disabled_is_skipped() {
        let frame = time_exceeded_quoting_echo(1, 2);
        let env = parse_icmp_frame(&frame, Framing::Ip, false, false).unwrap();
        assert!(env.mpls.is_none());
    }

    #[test]
    fn test_tcp_reply_flags() {
        let mut segment = vec![0u8; 20];
        segment[0..2].copy_from_slice(&443u16.to_be_bytes());
        segment[2..4].copy_from_slice(&50000u16.to_be_bytes());
        segment[8..12].copy_from_slice(&0x0800_0003u32.to_be_bytes()); // ack
        segment[12] = 0x50;
        segment[13] = 0x12; // SYN+ACK

        let reply = parse_tcp_reply(&segment, Framing::Transport, false).unwrap();
        assert!(reply.is_syn_ack());
        assert!(!reply.is_rst_ack());
        assert_eq!(reply.src_port, 443);
        assert_eq!(reply.dst_port, 50000);
        assert_eq!(reply.ack, 0x0800_0003);

        segment[13] = 0x14; // RST+ACK
        let reply = parse_tcp_reply(&segment, Framing::Transport, false).unwrap();
        assert!(reply.is_rst_ack());
    }
}
