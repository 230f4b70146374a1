//! TCP SYN tracer: handshake replies and ICMP errors both feed correlation.

use crate::packet;
use pathtrace_core::scheduler::{self, ProbeDialect, TraceSession};
use pathtrace_core::{ProbeReply, SeqKey, TraceConfig, TraceError, TraceResult};
use pathtrace_packets::{
    parse_icmp_frame, parse_tcp_reply, quoted_tcp_seq, spawn_listener, IcmpKind, PacketSource,
    TcpChannel, TcpReply,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const IPPROTO_TCP: u8 = 6;

/// Recovers the probe sequence from a handshake reply.
///
/// A SYN-ACK acknowledges our sequence plus one; a RST-ACK additionally
/// accounts for the probe payload the target consumed.
pub fn recover_seq(reply: &TcpReply, payload_len: usize) -> Option<SeqKey> {
    if reply.is_rst_ack() {
        Some(
            reply
                .ack
                .wrapping_sub(1)
                .wrapping_sub(payload_len as u32),
        )
    } else if reply.is_syn_ack() {
        Some(reply.ack.wrapping_sub(1))
    } else {
        None
    }
}

/// TCP SYN tracer for IPv4 and IPv6 destinations.
pub struct TcpTracer {
    session: TraceSession,
    icmp_ingress: Arc<dyn PacketSource>,
    channel: Arc<dyn TcpChannel>,
}

impl TcpTracer {
    pub fn new(
        config: TraceConfig,
        icmp_ingress: Arc<dyn PacketSource>,
        channel: Arc<dyn TcpChannel>,
    ) -> Self {
        Self {
            session: TraceSession::new(config),
            icmp_ingress,
            channel,
        }
    }

    pub fn session(&self) -> &TraceSession {
        &self.session
    }

    pub fn result(&self) -> Arc<TraceResult> {
        Arc::clone(&self.session.result)
    }

    pub async fn trace(&self) -> Result<(), TraceError> {
        let cfg = &self.session.config;
        cfg.validate()?;
        let src = cfg.src_addr.ok_or_else(|| TraceError::InvalidSourceAddress {
            addr: "<unset>".to_string(),
            reason: "source address must be resolved before tracing".to_string(),
        })?;
        if cfg.src_port == 0 {
            return Err(TraceError::InvalidSourceAddress {
                addr: src.to_string(),
                reason: "a source port must be allocated before tracing".to_string(),
            });
        }

        self.spawn_icmp_correlator();
        self.spawn_tcp_correlator();
        debug!(dest = %cfg.dest_ip, port = cfg.dest_port, "starting TCP trace");

        let dialect = Arc::new(SynDialect {
            channel: Arc::clone(&self.channel),
            src,
            dest: cfg.dest_ip,
            src_port: cfg.src_port,
            dest_port: cfg.dest_port,
            payload_len: cfg.pkt_size,
        });
        scheduler::run(&self.session, dialect).await
    }

    /// ICMP errors quoting our SYN carry the sequence in the quoted header.
    fn spawn_icmp_correlator(&self) {
        let session = self.session.clone();
        let framing = self.icmp_ingress.framing();
        let v6 = session.config.dest_ip.is_ipv6();
        let want_mpls = !session.config.disable_mpls;
        let dest = session.config.dest_ip;
        let src_port = session.config.src_port;
        let mut rx = spawn_listener(Arc::clone(&self.icmp_ingress), session.run.token());

        let tracker = session.tracker.clone();
        tracker.spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = session.run.cancelled() => return,
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => return,
                    },
                };

                let Some(envelope) = parse_icmp_frame(&msg.bytes, framing, v6, want_mpls)
                else {
                    continue;
                };
                if matches!(envelope.kind, IcmpKind::EchoReply { .. }) {
                    continue;
                }
                let Some(quoted) = envelope.quoted else { continue };
                if quoted.protocol != IPPROTO_TCP {
                    continue;
                }
                if !(quoted.dst == dest || (v6 && quoted.dst.is_unspecified())) {
                    continue;
                }
                if quoted.transport.len() >= 2 {
                    let quoted_src_port =
                        u16::from_be_bytes([quoted.transport[0], quoted.transport[1]]);
                    if quoted_src_port != src_port {
                        continue;
                    }
                }
                let Some(seq) = quoted_tcp_seq(&quoted.transport) else { continue };

                session.registry.dispatch(
                    seq,
                    ProbeReply {
                        peer: msg.peer,
                        mpls: envelope.mpls,
                    },
                );
            }
        });
    }

    /// SYN-ACK / RST-ACK replies from the destination carry the sequence in
    /// their acknowledgement number.
    fn spawn_tcp_correlator(&self) {
        let session = self.session.clone();
        let framing = self.channel.framing();
        let v6 = session.config.dest_ip.is_ipv6();
        let dest = session.config.dest_ip;
        let dest_port = session.config.dest_port;
        let payload_len = session.config.pkt_size;
        let mut rx = spawn_listener(Arc::clone(&self.channel), session.run.token());

        let tracker = session.tracker.clone();
        tracker.spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = session.run.cancelled() => return,
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => return,
                    },
                };

                if msg.peer != dest {
                    continue;
                }
                let Some(reply) = parse_tcp_reply(&msg.bytes, framing, v6) else {
                    continue;
                };
                if reply.src_port != dest_port {
                    continue;
                }
                let Some(seq) = recover_seq(&reply, payload_len) else { continue };

                session.registry.dispatch(
                    seq,
                    ProbeReply {
                        peer: msg.peer,
                        mpls: None,
                    },
                );
            }
        });
    }
}

struct SynDialect {
    channel: Arc<dyn TcpChannel>,
    src: IpAddr,
    dest: IpAddr,
    src_port: u16,
    dest_port: u16,
    payload_len: usize,
}

impl ProbeDialect for SynDialect {
    fn encode_seq(&self, ttl: u8, attempt: u8) -> SeqKey {
        ((ttl as SeqKey) << 24) | (attempt as SeqKey & 0x00FF_FFFF)
    }

    fn dispatch_probe(&self, ttl: u8, _attempt: u8, seq: SeqKey) -> Result<Instant, TraceError> {
        let segment = match (self.src, self.dest) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => packet::syn_segment_v4(
                src,
                dst,
                self.src_port,
                self.dest_port,
                seq,
                self.payload_len,
            )?,
            (IpAddr::V6(src), IpAddr::V6(dst)) => packet::syn_segment_v6(
                src,
                dst,
                self.src_port,
                self.dest_port,
                seq,
                self.payload_len,
            )?,
            _ => {
                return Err(TraceError::AddressFamilyMismatch {
                    src: self.src,
                    dest: self.dest,
                })
            }
        };
        self.channel
            .send_syn(&segment, ttl)
            .map_err(TraceError::WriteFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(ack: u32, syn: bool, rst: bool) -> TcpReply {
        TcpReply {
            src_port: 443,
            dst_port: 50000,
            ack,
            syn,
            rst,
            is_ack: true,
        }
    }

    #[test]
    fn test_syn_ack_recovery() {
        let seq = (8u32 << 24) | 3;
        assert_eq!(recover_seq(&reply(seq + 1, true, false), 16), Some(seq));
    }

    #[test]
    fn test_rst_ack_recovery() {
        let seq = (9u32 << 24) | 1;
        let payload = 16usize;
        assert_eq!(
            recover_seq(&reply(seq + 1 + payload as u32, false, true), payload),
            Some(seq)
        );
    }

    #[test]
    fn test_plain_ack_ignored() {
        assert_eq!(recover_seq(&reply(42, false, false), 0), None);
    }

    #[test]
    fn test_seq_encoding_masks_attempt() {
        let dialect_seq =
            |ttl: u8, attempt: u8| ((ttl as SeqKey) << 24) | (attempt as SeqKey & 0x00FF_FFFF);
        assert_eq!(dialect_seq(8, 3), (8 << 24) | 3);
        assert_eq!(dialect_seq(255, 255), (255 << 24) | 255);
    }
}
