//! UDP tracer: probes out through the raw socket, ICMP errors back.

use crate::packet::{self, UdpSeqCodec};
use pathtrace_core::scheduler::{self, ProbeDialect, TraceSession};
use pathtrace_core::{ProbeReply, SeqKey, TraceConfig, TraceError, TraceResult};
use pathtrace_packets::{
    parse_icmp_frame, quoted_udp, spawn_listener, IcmpKind, PacketSource, ProbeSink,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const IPPROTO_UDP: u8 = 17;

/// UDP tracer for IPv4 and IPv6 destinations.
pub struct UdpTracer {
    session: TraceSession,
    ingress: Arc<dyn PacketSource>,
    egress: Arc<dyn ProbeSink>,
}

impl UdpTracer {
    pub fn new(
        config: TraceConfig,
        ingress: Arc<dyn PacketSource>,
        egress: Arc<dyn ProbeSink>,
    ) -> Self {
        Self {
            session: TraceSession::new(config),
            ingress,
            egress,
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

        let codec = UdpSeqCodec::new(cfg.dest_ip.is_ipv6(), cfg.dest_port, cfg.max_attempts);
        self.spawn_correlator(codec);
        debug!(dest = %cfg.dest_ip, port = cfg.dest_port, "starting UDP trace");

        let dialect = Arc::new(UdpDialect {
            egress: Arc::clone(&self.egress),
            src,
            dest: cfg.dest_ip,
            src_port: cfg.src_port,
            codec,
            payload_len: cfg.pkt_size,
        });
        scheduler::run(&self.session, dialect).await
    }

    /// Routes quoted UDP probes from ICMP errors back to their senders.
    fn spawn_correlator(&self, codec: UdpSeqCodec) {
        let session = self.session.clone();
        let framing = self.ingress.framing();
        let v6 = session.config.dest_ip.is_ipv6();
        let want_mpls = !session.config.disable_mpls;
        let dest = session.config.dest_ip;
        let src_port = session.config.src_port;
        let mut rx = spawn_listener(Arc::clone(&self.ingress), session.run.token());

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
                if quoted.protocol != IPPROTO_UDP {
                    continue;
                }
                if !(quoted.dst == dest || (v6 && quoted.dst.is_unspecified())) {
                    continue;
                }
                let Some(header) = quoted_udp(&quoted.transport) else { continue };
                if src_port != 0 && header.src_port != src_port {
                    continue;
                }

                let key = if v6 {
                    match codec.key_from_port(header.dst_port) {
                        Some(key) => key,
                        None => continue,
                    }
                } else {
                    codec.key_from_ip_id(quoted.ip_id)
                };

                session.registry.dispatch(
                    key,
                    ProbeReply {
                        peer: msg.peer,
                        mpls: envelope.mpls,
                    },
                );
            }
        });
    }
}

struct UdpDialect {
    egress: Arc<dyn ProbeSink>,
    src: IpAddr,
    dest: IpAddr,
    src_port: u16,
    codec: UdpSeqCodec,
    payload_len: usize,
}

impl ProbeDialect for UdpDialect {
    fn encode_seq(&self, ttl: u8, attempt: u8) -> SeqKey {
        self.codec.key(ttl, attempt)
    }

    fn dispatch_probe(&self, ttl: u8, attempt: u8, seq: SeqKey) -> Result<Instant, TraceError> {
        let packet = match (self.src, self.dest) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => packet::udp_probe_v4(
                src,
                dst,
                self.src_port,
                self.codec.dest_port(ttl, attempt),
                seq as u16,
                ttl,
                attempt,
                self.payload_len,
            )?,
            (IpAddr::V6(src), IpAddr::V6(dst)) => packet::udp_segment_v6(
                src,
                dst,
                self.src_port,
                self.codec.dest_port(ttl, attempt),
                ttl,
                attempt,
                self.payload_len,
            )?,
            _ => {
                return Err(TraceError::AddressFamilyMismatch {
                    src: self.src,
                    dest: self.dest,
                })
            }
        };
        self.egress
            .send(&packet, self.dest, ttl)
            .map_err(TraceError::WriteFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_key_matches_codec() {
        let codec = UdpSeqCodec::new(false, 33494, 3);
        let dialect = UdpDialect {
            egress: Arc::new(NullSink),
            src: "192.168.0.2".parse().unwrap(),
            dest: "93.184.216.34".parse().unwrap(),
            src_port: 40000,
            codec,
            payload_len: 8,
        };
        assert_eq!(dialect.encode_seq(9, 1), (9 << 8) | 1);
    }

    struct NullSink;

    impl ProbeSink for NullSink {
        fn send(&self, _packet: &[u8], _dst: IpAddr, _ttl: u8) -> std::io::Result<Instant> {
            Ok(Instant::now())
        }

        fn close(&self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
