//! End-to-end ICMP traces over an in-memory fake network.

use pathtrace_core::{HopError, RdnsPolicy, TraceConfig};
use pathtrace_icmp::IcmpTracer;
use pathtrace_packets::{Framing, PacketSource, ProbeSink};
use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

const SRC: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 0, 2));
const DEST: IpAddr = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));

fn router(ttl: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, ttl))
}

/// In-memory ICMP network: echoes the script back for every probe sent.
///
/// Probes and replies are bare ICMPv4 messages (`Framing::Transport`),
/// matching what a DGRAM ping socket would deliver.
struct FakeIcmpNet {
    /// TTL at which the destination answers with an echo reply.
    dest_ttl: u8,
    /// TTLs that never answer.
    silent: HashSet<u8>,
    queue: Mutex<VecDeque<(Vec<u8>, IpAddr)>>,
    ready: Condvar,
}

impl FakeIcmpNet {
    fn new(dest_ttl: u8, silent: impl IntoIterator<Item = u8>) -> Arc<Self> {
        Arc::new(Self {
            dest_ttl,
            silent: silent.into_iter().collect(),
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        })
    }

    fn push(&self, frame: Vec<u8>, peer: IpAddr) {
        self.queue.lock().unwrap().push_back((frame, peer));
        self.ready.notify_one();
    }

    fn echo_reply(ident: u16, seq: u16) -> Vec<u8> {
        let mut icmp = vec![0u8; 8];
        icmp[0] = 0; // echo reply
        icmp[4..6].copy_from_slice(&ident.to_be_bytes());
        icmp[6..8].copy_from_slice(&seq.to_be_bytes());
        icmp
    }

    fn time_exceeded(ident: u16, seq: u16) -> Vec<u8> {
        let mut icmp = vec![0u8; 8];
        icmp[0] = 11; // time exceeded

        // quoted probe: IPv4 header towards the destination + echo request
        let mut inner = vec![0u8; 20];
        inner[0] = 0x45;
        inner[8] = 1;
        inner[9] = 1; // protocol: ICMP
        if let (IpAddr::V4(s), IpAddr::V4(d)) = (SRC, DEST) {
            inner[12..16].copy_from_slice(&s.octets());
            inner[16..20].copy_from_slice(&d.octets());
        }
        icmp.extend_from_slice(&inner);

        let mut echo = vec![0u8; 8];
        echo[0] = 8;
        echo[4..6].copy_from_slice(&ident.to_be_bytes());
        echo[6..8].copy_from_slice(&seq.to_be_bytes());
        icmp.extend_from_slice(&echo);
        icmp
    }
}

impl PacketSource for FakeIcmpNet {
    fn framing(&self) -> Framing {
        Framing::Transport
    }

    fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, IpAddr)> {
        let mut queue = self.queue.lock().unwrap();
        if queue.is_empty() {
            let (guard, _) = self
                .ready
                .wait_timeout(queue, Duration::from_millis(20))
                .unwrap();
            queue = guard;
        }
        match queue.pop_front() {
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

    fn close(&self) -> std::io::Result<()> {
        Ok(())
    }
}

impl ProbeSink for FakeIcmpNet {
    fn send(&self, packet: &[u8], _dst: IpAddr, ttl: u8) -> std::io::Result<Instant> {
        let start = Instant::now();
        assert_eq!(packet[0], 8, "probe must be an echo request");
        let ident = u16::from_be_bytes([packet[4], packet[5]]);
        let seq = u16::from_be_bytes([packet[6], packet[7]]);
        assert_eq!((seq >> 8) as u8, ttl, "sequence must encode the egress TTL");

        if self.silent.contains(&ttl) {
            return Ok(start);
        }
        if ttl >= self.dest_ttl {
            self.push(Self::echo_reply(ident, seq), DEST);
        } else {
            self.push(Self::time_exceeded(ident, seq), router(ttl));
        }
        Ok(start)
    }

    fn close(&self) -> std::io::Result<()> {
        Ok(())
    }
}

fn test_config(max_hops: u8) -> TraceConfig {
    let mut cfg = TraceConfig::new(DEST);
    cfg.src_addr = Some(SRC);
    cfg.max_hops = max_hops;
    cfg.num_measurements = 3;
    cfg.max_attempts = 3;
    cfg.packet_interval = Duration::from_millis(5);
    cfg.ttl_interval = Duration::from_millis(5);
    cfg.timeout = Duration::from_millis(200);
    cfg.rdns = RdnsPolicy::Off;
    cfg
}

#[tokio::test(flavor = "multi_thread")]
async fn trace_reaches_destination() {
    let net = FakeIcmpNet::new(5, []);
    let tracer = IcmpTracer::new(
        test_config(5),
        Arc::clone(&net) as Arc<dyn PacketSource>,
        Arc::clone(&net) as Arc<dyn ProbeSink>,
    );

    tracer.trace().await.unwrap();

    let hops = tracer.result().snapshot();
    assert_eq!(hops.len(), 5);
    for (idx, slot) in hops.iter().enumerate() {
        assert_eq!(slot.len(), 3, "slot {} not full", idx + 1);
    }
    for ttl in 1..=4u8 {
        assert!(hops[ttl as usize - 1]
            .iter()
            .all(|h| h.address == Some(router(ttl))));
    }
    assert!(hops[4].iter().all(|h| h.address == Some(DEST)));
    assert!(tracer.session().registry.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_routers_become_timeouts() {
    let net = FakeIcmpNet::new(5, [2u8, 3]);
    let tracer = IcmpTracer::new(
        test_config(5),
        Arc::clone(&net) as Arc<dyn PacketSource>,
        Arc::clone(&net) as Arc<dyn ProbeSink>,
    );

    tracer.trace().await.unwrap();

    let hops = tracer.result().snapshot();
    assert_eq!(hops.len(), 5);
    for ttl in [2usize, 3] {
        assert!(hops[ttl - 1]
            .iter()
            .all(|h| !h.success && h.error == Some(HopError::HopLimitTimeout)));
        assert_eq!(hops[ttl - 1].len(), 3);
    }
    assert!(hops[0].iter().all(|h| h.success));
    assert!(hops[4].iter().all(|h| h.address == Some(DEST)));
}

#[tokio::test(flavor = "multi_thread")]
async fn early_destination_truncates_result() {
    let net = FakeIcmpNet::new(3, []);
    let tracer = IcmpTracer::new(
        test_config(30),
        Arc::clone(&net) as Arc<dyn PacketSource>,
        Arc::clone(&net) as Arc<dyn ProbeSink>,
    );

    tracer.trace().await.unwrap();

    let hops = tracer.result().snapshot();
    assert_eq!(hops.len(), 3);
    assert!(hops[2].iter().all(|h| h.address == Some(DEST)));
}

#[tokio::test(flavor = "multi_thread")]
async fn unresolved_source_is_rejected() {
    let net = FakeIcmpNet::new(2, []);
    let mut cfg = test_config(2);
    cfg.src_addr = None;
    let tracer = IcmpTracer::new(
        cfg,
        Arc::clone(&net) as Arc<dyn PacketSource>,
        Arc::clone(&net) as Arc<dyn ProbeSink>,
    );
    assert!(tracer.trace().await.is_err());
}
