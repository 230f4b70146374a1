//! ICMP tracer: echo probes out, echo replies and ICMP errors back.

use crate::packet;
use pathtrace_core::scheduler::{self, ProbeDialect, TraceSession};
use pathtrace_core::{ProbeReply, SeqKey, TraceConfig, TraceError, TraceResult};
use pathtrace_packets::{
    parse_icmp_frame, quoted_echo, spawn_listener, IcmpKind, PacketSource, ProbeSink,
};
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Identifier carried by every echo request of this process.
fn echo_ident() -> u16 {
    (std::process::id() & 0xFFFF) as u16
}

/// ICMP echo tracer for IPv4 and IPv6 destinations.
pub struct IcmpTracer {
    session: TraceSession,
    ingress: Arc<dyn PacketSource>,
    egress: Arc<dyn ProbeSink>,
    ident: u16,
}

impl IcmpTracer {
    pub fn new(
        config: TraceConfig,
        ingress: Arc<dyn PacketSource>,
        egress: Arc<dyn ProbeSink>,
    ) -> Self {
        Self {
            session: TraceSession::new(config),
            ingress,
            egress,
            ident: echo_ident(),
        }
    }

    pub fn session(&self) -> &TraceSession {
        &self.session
    }

    pub fn result(&self) -> Arc<TraceResult> {
        Arc::clone(&self.session.result)
    }

    /// Runs the trace to completion.
    pub async fn trace(&self) -> Result<(), TraceError> {
        let cfg = &self.session.config;
        cfg.validate()?;
        let src = cfg.src_addr.ok_or_else(|| TraceError::InvalidSourceAddress {
            addr: "<unset>".to_string(),
            reason: "source address must be resolved before tracing".to_string(),
        })?;

        let src_v6 = match (src, cfg.dest_ip) {
            (IpAddr::V6(s), IpAddr::V6(_)) => Some(s),
            _ => None,
        };

        self.spawn_correlator();
        debug!(dest = %cfg.dest_ip, ident = self.ident, "starting ICMP trace");

        let dialect = Arc::new(EchoDialect {
            egress: Arc::clone(&self.egress),
            dest: cfg.dest_ip,
            src_v6,
            ident: self.ident,
            payload_len: cfg.pkt_size,
        });
        scheduler::run(&self.session, dialect).await
    }

    /// Consumes the ingress stream, routing echo replies and quoted echo
    /// requests back to their probes.
    fn spawn_correlator(&self) {
        let session = self.session.clone();
        let framing = self.ingress.framing();
        let v6 = session.config.dest_ip.is_ipv6();
        let want_mpls = !session.config.disable_mpls;
        let dest = session.config.dest_ip;
        let ident = self.ident;
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

                match envelope.kind {
                    IcmpKind::EchoReply { ident: reply_ident, seq } => {
                        if reply_ident != ident {
                            continue;
                        }
                        session.registry.dispatch(
                            seq as SeqKey,
                            ProbeReply {
                                peer: msg.peer,
                                mpls: None,
                            },
                        );
                    }
                    _ => {
                        let Some(quoted) = envelope.quoted else { continue };
                        if !inner_dest_matches(quoted.dst, dest) {
                            continue;
                        }
                        let Some((quoted_ident, seq)) = quoted_echo(&quoted.transport, v6)
                        else {
                            continue;
                        };
                        if quoted_ident != ident {
                            continue;
                        }
                        session.registry.dispatch(
                            seq as SeqKey,
                            ProbeReply {
                                peer: msg.peer,
                                mpls: envelope.mpls,
                            },
                        );
                    }
                }
            }
        });
    }
}

/// The quoted destination must be the trace target; IPv6 errors may quote
/// the unspecified address instead.
fn inner_dest_matches(quoted_dst: IpAddr, dest: IpAddr) -> bool {
    quoted_dst == dest || quoted_dst == IpAddr::V6(Ipv6Addr::UNSPECIFIED)
}

struct EchoDialect {
    egress: Arc<dyn ProbeSink>,
    dest: IpAddr,
    src_v6: Option<Ipv6Addr>,
    ident: u16,
    payload_len: usize,
}

impl ProbeDialect for EchoDialect {
    fn encode_seq(&self, ttl: u8, attempt: u8) -> SeqKey {
        ((ttl as SeqKey) << 8) | attempt as SeqKey
    }

    fn dispatch_probe(&self, ttl: u8, _attempt: u8, seq: SeqKey) -> Result<Instant, TraceError> {
        let packet = match (self.dest, self.src_v6) {
            (IpAddr::V6(dst), Some(src)) => {
                packet::echo_request_v6(self.ident, seq as u16, self.payload_len, src, dst)?
            }
            _ => packet::echo_request_v4(self.ident, seq as u16, self.payload_len)?,
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
    fn test_seq_round_trip() {
        let dialect = EchoDialect {
            egress: Arc::new(NullSink),
            dest: "127.0.0.1".parse().unwrap(),
            src_v6: None,
            ident: 1,
            payload_len: 0,
        };
        for ttl in [1u8, 7, 64, 255] {
            for attempt in [0u8, 1, 5, 254] {
                let seq = dialect.encode_seq(ttl, attempt);
                assert_eq!((seq >> 8) as u8, ttl);
                assert_eq!((seq & 0xFF) as u8, attempt);
            }
        }
    }

    #[test]
    fn test_inner_dest_matching() {
        let dest: IpAddr = "2001:db8::5".parse().unwrap();
        assert!(inner_dest_matches(dest, dest));
        assert!(inner_dest_matches("::".parse().unwrap(), dest));
        assert!(!inner_dest_matches("2001:db8::6".parse().unwrap(), dest));
    }

    struct NullSink;

    impl ProbeSink for NullSink {
        fn send(
            &self,
            _packet: &[u8],
            _dst: IpAddr,
            _ttl: u8,
        ) -> std::io::Result<Instant> {
            Ok(Instant::now())
        }

        fn close(&self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
