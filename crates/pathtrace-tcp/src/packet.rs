//! TCP SYN probe construction using pnet.

use pathtrace_core::TraceError;
use pnet_packet::tcp::{MutableTcpPacket, TcpFlags};
use rand::Rng;
use std::net::{Ipv4Addr, Ipv6Addr};

/// TCP header size without options.
pub const TCP_HEADER_LEN: usize = 20;

/// Window advertised in SYN probes.
pub const SYN_WINDOW: u16 = 14600;

fn random_payload(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

fn fill_syn(
    buffer: &mut [u8],
    src_port: u16,
    dst_port: u16,
    seq: u32,
    payload: &[u8],
) -> Result<(), TraceError> {
    let mut tcp = MutableTcpPacket::new(buffer)
        .ok_or_else(|| TraceError::Internal("SYN buffer too small".to_string()))?;
    tcp.set_source(src_port);
    tcp.set_destination(dst_port);
    tcp.set_sequence(seq);
    tcp.set_acknowledgement(0);
    tcp.set_data_offset(5);
    tcp.set_flags(TcpFlags::SYN);
    tcp.set_window(SYN_WINDOW);
    tcp.set_urgent_ptr(0);
    tcp.set_payload(payload);
    Ok(())
}

/// Builds an IPv4 TCP SYN segment (no IP header; TTL is set on the socket).
pub fn syn_segment_v4(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    payload_len: usize,
) -> Result<Vec<u8>, TraceError> {
    let payload = random_payload(payload_len);
    let mut buffer = vec![0u8; TCP_HEADER_LEN + payload.len()];
    fill_syn(&mut buffer, src_port, dst_port, seq, &payload)?;

    let mut tcp = MutableTcpPacket::new(&mut buffer)
        .ok_or_else(|| TraceError::Internal("SYN buffer too small".to_string()))?;
    let checksum = pnet_packet::tcp::ipv4_checksum(&tcp.to_immutable(), &src, &dst);
    tcp.set_checksum(checksum);
    Ok(buffer)
}

/// Builds an IPv6 TCP SYN segment.
pub fn syn_segment_v6(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    payload_len: usize,
) -> Result<Vec<u8>, TraceError> {
    let payload = random_payload(payload_len);
    let mut buffer = vec![0u8; TCP_HEADER_LEN + payload.len()];
    fill_syn(&mut buffer, src_port, dst_port, seq, &payload)?;

    let mut tcp = MutableTcpPacket::new(&mut buffer)
        .ok_or_else(|| TraceError::Internal("SYN buffer too small".to_string()))?;
    let checksum = pnet_packet::tcp::ipv6_checksum(&tcp.to_immutable(), &src, &dst);
    tcp.set_checksum(checksum);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syn_segment_layout() {
        let src = Ipv4Addr::new(192, 168, 0, 2);
        let dst = Ipv4Addr::new(93, 184, 216, 34);
        let seq = (8u32 << 24) | 3;
        let segment = syn_segment_v4(src, dst, 50000, 443, seq, 16).unwrap();

        assert_eq!(segment.len(), TCP_HEADER_LEN + 16);
        assert_eq!(u16::from_be_bytes([segment[0], segment[1]]), 50000);
        assert_eq!(u16::from_be_bytes([segment[2], segment[3]]), 443);
        assert_eq!(
            u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
            seq
        );
        // SYN only, no ACK
        assert_eq!(segment[13] & 0x3F, 0x02);
        assert_eq!(
            u16::from_be_bytes([segment[14], segment[15]]),
            SYN_WINDOW
        );
    }

    #[test]
    fn test_syn_segment_v6_checksum_present() {
        let src: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::5".parse().unwrap();
        let segment = syn_segment_v6(src, dst, 50000, 443, 1, 0).unwrap();
        assert_eq!(segment.len(), TCP_HEADER_LEN);
        let checksum = u16::from_be_bytes([segment[16], segment[17]]);
        assert_ne!(checksum, 0);
    }
}
