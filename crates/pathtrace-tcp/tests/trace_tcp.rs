//! End-to-end TCP SYN traces over an in-memory fake network (IPv4).

use pathtrace_core::{RdnsPolicy, TraceConfig};
use pathtrace_packets::{Framing, PacketSource, TcpChannel};
use pathtrace_tcp::TcpTracer;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

const SRC: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 0, 2));
const DEST: IpAddr = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));
const SRC_PORT: u16 = 50000;
const DEST_PORT: u16 = 443;

fn router(ttl: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, ttl))
}

/// How the fake destination answers a SYN that reaches it.
#[derive(Clone, Copy)]
enum Handshake {
    SynAck,
    RstAck,
}

struct Queue {
    frames: Mutex<VecDeque<(Vec<u8>, IpAddr)>>,
    ready: Condvar,
}

impl Queue {
    fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    fn push(&self, frame: Vec<u8>, peer: IpAddr) {
        self.frames.lock().unwrap().push_back((frame, peer));
        self.ready.notify_one();
    }

    fn pop(&self, buf: &mut [u8]) -> std::io::Result<(usize, IpAddr)> {
        let mut frames = self.frames.lock().unwrap();
        if frames.is_empty() {
            let (guard, _) = self
                .ready
                .wait_timeout(frames, Duration::from_millis(20))
                .unwrap();
            frames = guard;
        }
        match frames.pop_front() {
            Some((frame, peer)) => {
                buf[..frame.len()].copy_from_slice(&frame);
                Ok((frame.len(), peer))
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "no frames queued",
            )),
        }
    }
}

/// Fake wire shared by the ICMP ingress and the TCP channel.
struct FakeWire {
    dest_ttl: u8,
    handshake: Handshake,
    payload_len: usize,
    icmp: Queue,
    tcp: Queue,
}

impl FakeWire {
    fn new(dest_ttl: u8, handshake: Handshake, payload_len: usize) -> Arc<Self> {
        Arc::new(Self {
            dest_ttl,
            handshake,
            payload_len,
            icmp: Queue::new(),
            tcp: Queue::new(),
        })
    }

    /// Time Exceeded quoting the SYN behind an IPv4 header to the target.
    fn time_exceeded(segment: &[u8]) -> Vec<u8> {
        let mut icmp = vec![0u8; 8];
        icmp[0] = 11;
        let mut inner = vec![0u8; 20];
        inner[0] = 0x45;
        inner[8] = 1;
        inner[9] = 6; // protocol: TCP
        if let (IpAddr::V4(s), IpAddr::V4(d)) = (SRC, DEST) {
            inner[12..16].copy_from_slice(&s.octets());
            inner[16..20].copy_from_slice(&d.octets());
        }
        icmp.extend_from_slice(&inner);
        icmp.extend_from_slice(&segment[..8]);
        icmp
    }

    /// Handshake reply segment acknowledging `seq`.
    fn handshake_reply(&self, seq: u32) -> Vec<u8> {
        let mut segment = vec![0u8; 20];
        segment[0..2].copy_from_slice(&DEST_PORT.to_be_bytes());
        segment[2..4].copy_from_slice(&SRC_PORT.to_be_bytes());
        segment[12] = 0x50;
        match self.handshake {
            Handshake::SynAck => {
                segment[8..12].copy_from_slice(&(seq.wrapping_add(1)).to_be_bytes());
                segment[13] = 0x12;
            }
            Handshake::RstAck => {
                let ack = seq.wrapping_add(1).wrapping_add(self.payload_len as u32);
                segment[8..12].copy_from_slice(&ack.to_be_bytes());
                segment[13] = 0x14;
            }
        }
        segment
    }
}

/// ICMP side of the fake wire.
struct IcmpPort(Arc<FakeWire>);

impl PacketSource for IcmpPort {
    fn framing(&self) -> Framing {
        Framing::Transport
    }

    fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, IpAddr)> {
        self.0.icmp.pop(buf)
    }

    fn close(&self) -> std::io::Result<()> {
        Ok(())
    }
}

/// TCP side of the fake wire; sending a SYN arms the scripted reply.
struct TcpPort(Arc<FakeWire>);

impl PacketSource for TcpPort {
    fn framing(&self) -> Framing {
        Framing::Transport
    }

    fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, IpAddr)> {
        self.0.tcp.pop(buf)
    }

    fn close(&self) -> std::io::Result<()> {
        Ok(())
    }
}

impl TcpChannel for TcpPort {
    fn send_syn(&self, segment: &[u8], ttl: u8) -> std::io::Result<Instant> {
        let start = Instant::now();
        assert_eq!(segment[13] & 0x3F, 0x02, "probe must be a bare SYN");
        let seq = u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]);
        assert_eq!((seq >> 24) as u8, ttl, "sequence must encode the egress TTL");

        let wire = &self.0;
        if ttl >= wire.dest_ttl {
            wire.tcp.push(wire.handshake_reply(seq), DEST);
        } else {
            wire.icmp.push(FakeWire::time_exceeded(segment), router(ttl));
        }
        Ok(start)
    }
}

fn test_config(max_hops: u8, payload_len: usize) -> TraceConfig {
    let mut cfg = TraceConfig::new(DEST);
    cfg.src_addr = Some(SRC);
    cfg.src_port = SRC_PORT;
    cfg.dest_port = DEST_PORT;
    cfg.max_hops = max_hops;
    cfg.num_measurements = 2;
    cfg.max_attempts = 2;
    cfg.packet_interval = Duration::from_millis(5);
    cfg.ttl_interval = Duration::from_millis(5);
    cfg.timeout = Duration::from_millis(200);
    cfg.pkt_size = payload_len;
    cfg.rdns = RdnsPolicy::Off;
    cfg
}

#[tokio::test(flavor = "multi_thread")]
async fn syn_ack_completes_the_trace() {
    let wire = FakeWire::new(3, Handshake::SynAck, 16);
    let tracer = TcpTracer::new(
        test_config(10, 16),
        Arc::new(IcmpPort(Arc::clone(&wire))),
        Arc::new(TcpPort(Arc::clone(&wire))),
    );

    tracer.trace().await.unwrap();

    let hops = tracer.result().snapshot();
    assert_eq!(hops.len(), 3);
    for ttl in 1..=2u8 {
        let slot = &hops[ttl as usize - 1];
        assert_eq!(slot.len(), 2);
        assert!(slot.iter().all(|h| h.address == Some(router(ttl))));
    }
    assert!(hops[2].iter().all(|h| h.address == Some(DEST)));
    assert!(tracer.session().registry.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn rst_ack_recovers_the_same_sequence() {
    let wire = FakeWire::new(2, Handshake::RstAck, 24);
    let tracer = TcpTracer::new(
        test_config(10, 24),
        Arc::new(IcmpPort(Arc::clone(&wire))),
        Arc::new(TcpPort(Arc::clone(&wire))),
    );

    tracer.trace().await.unwrap();

    let hops = tracer.result().snapshot();
    assert_eq!(hops.len(), 2);
    assert!(hops[0].iter().all(|h| h.address == Some(router(1))));
    assert!(hops[1].iter().all(|h| h.address == Some(DEST)));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_source_port_is_rejected() {
    let wire = FakeWire::new(2, Handshake::SynAck, 0);
    let mut cfg = test_config(2, 0);
    cfg.src_port = 0;
    let tracer = TcpTracer::new(
        cfg,
        Arc::new(IcmpPort(Arc::clone(&wire))),
        Arc::new(TcpPort(Arc::clone(&wire))),
    );
    assert!(tracer.trace().await.is_err());
}
