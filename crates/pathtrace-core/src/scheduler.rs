//! Probe scheduler: TTL fan-out, pacing, timeouts and result recording.
//!
//! The scheduler is shared by every protocol dialect. A dialect only knows how
//! to encode a `(ttl, attempt)` pair into its sequence key and how to put one
//! probe on the wire; group pacing, the parallelism cap, reply and timeout
//! bookkeeping, the printer poller and cancellation all live here.

use crate::hop::Hop;
use crate::inflight::{InflightRegistry, SeqKey};
use crate::run::{EndCause, RunToken};
use crate::types::{RdnsPolicy, TraceConfig};
use crate::{FinalHop, TraceError, TraceResult};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

/// Poll cadence of the printer driver.
const PRINT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);

/// Protocol-specific half of a tracer.
///
/// `dispatch_probe` must serialize the packet, set the egress TTL and write,
/// holding the dialect's TTL lock across the set and the write, and return
/// the timestamp taken between them.
pub trait ProbeDialect: Send + Sync {
    /// Encodes `(ttl, attempt)` into the sequence key carried by the probe.
    fn encode_seq(&self, ttl: u8, attempt: u8) -> SeqKey;

    /// Sends one probe; returns the instant the packet left.
    fn dispatch_probe(&self, ttl: u8, attempt: u8, seq: SeqKey) -> Result<Instant, TraceError>;
}

/// Shared state of one trace run.
#[derive(Clone)]
pub struct TraceSession {
    pub config: TraceConfig,
    pub result: Arc<TraceResult>,
    pub registry: Arc<InflightRegistry>,
    pub final_hop: Arc<FinalHop>,
    pub run: RunToken,
    pub tracker: TaskTracker,
}

impl TraceSession {
    pub fn new(config: TraceConfig) -> Self {
        Self {
            config,
            result: Arc::new(TraceResult::new()),
            registry: Arc::new(InflightRegistry::new()),
            final_hop: Arc::new(FinalHop::new()),
            run: RunToken::new(),
            tracker: TaskTracker::new(),
        }
    }
}

/// Runs the trace to completion over `dialect`.
///
/// Returns `Ok(())` on natural completion; otherwise the cancellation cause.
/// The session's result is populated (and reduced) either way.
pub async fn run(
    session: &TraceSession,
    dialect: Arc<dyn ProbeDialect>,
) -> Result<(), TraceError> {
    let cfg = session.config.clone();
    session.result.init(cfg.max_hops)?;

    // Interrupt scope: first Ctrl-C flips the run into cancellation.
    let signal_run = session.run.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = signal_run.cancelled() => {}
            res = tokio::signal::ctrl_c() => {
                if res.is_ok() {
                    debug!("interrupt received, cancelling run");
                    signal_run.cancel_with(EndCause::Interrupted);
                }
            }
        }
    });

    let resolver = Arc::new(build_resolver(cfg.rdns));
    let semaphore = Arc::new(Semaphore::new(cfg.parallel_requests));

    spawn_printer(session.clone());
    spawn_ttl_driver(session.clone(), Arc::clone(&dialect), semaphore, resolver);

    session.run.cancelled().await;
    session.tracker.close();
    session.tracker.wait().await;

    let bound = session.final_hop.get().unwrap_or(cfg.max_hops);
    session.result.reduce(bound);

    match session.run.take_cause() {
        Some(EndCause::NaturalDone) | None => Ok(()),
        Some(EndCause::Interrupted) => Err(TraceError::Cancelled),
        Some(EndCause::Fault(err)) => Err(err),
    }
}

fn build_resolver(policy: RdnsPolicy) -> Option<TokioAsyncResolver> {
    if policy == RdnsPolicy::Off {
        return None;
    }
    Some(TokioAsyncResolver::tokio(
        ResolverConfig::default(),
        ResolverOpts::default(),
    ))
}

/// Launches the first TTL group immediately, then one group per TTL interval.
fn spawn_ttl_driver(
    session: TraceSession,
    dialect: Arc<dyn ProbeDialect>,
    semaphore: Arc<Semaphore>,
    resolver: Arc<Option<TokioAsyncResolver>>,
) {
    let tracker = session.tracker.clone();
    tracker.spawn(async move {
        let cfg = session.config.clone();
        launch_ttl(
            &session,
            &dialect,
            &semaphore,
            &resolver,
            cfg.begin_hop,
        );

        let mut ticker = tokio::time::interval(cfg.ttl_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // the immediate tick

        for ttl in cfg.begin_hop.saturating_add(1)..=cfg.max_hops {
            tokio::select! {
                _ = session.run.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if session.final_hop.skips(ttl) {
                return;
            }
            launch_ttl(&session, &dialect, &semaphore, &resolver, ttl);
        }
    });
}

/// Issues up to `max_attempts` probes for one TTL, paced by the packet
/// interval, stopping early once the slot is fully measured.
fn launch_ttl(
    session: &TraceSession,
    dialect: &Arc<dyn ProbeDialect>,
    semaphore: &Arc<Semaphore>,
    resolver: &Arc<Option<TokioAsyncResolver>>,
    ttl: u8,
) {
    let session = session.clone();
    let dialect = Arc::clone(dialect);
    let semaphore = Arc::clone(semaphore);
    let resolver = Arc::clone(resolver);
    let tracker = session.tracker.clone();
    tracker.spawn(async move {
        let cfg = session.config.clone();
        for attempt in 0..cfg.max_attempts as u8 {
            if session.result.ttl_complete(ttl, cfg.num_measurements)
                || session.run.is_cancelled()
            {
                return;
            }

            let probe_session = session.clone();
            let probe_dialect = Arc::clone(&dialect);
            let probe_semaphore = Arc::clone(&semaphore);
            let probe_resolver = Arc::clone(&resolver);
            session.tracker.spawn(async move {
                let run = probe_session.run.clone();
                if let Err(err) = probe(
                    probe_session,
                    probe_dialect,
                    probe_semaphore,
                    probe_resolver,
                    ttl,
                    attempt,
                )
                .await
                {
                    warn!(error = %err, ttl, attempt, "probe failed");
                    run.cancel_with(EndCause::Fault(err));
                }
            });

            tokio::select! {
                _ = session.run.cancelled() => return,
                _ = tokio::time::sleep(cfg.packet_interval) => {}
            }
        }
    });
}

/// One probe: register, send, await reply/timeout/cancellation, record.
async fn probe(
    session: TraceSession,
    dialect: Arc<dyn ProbeDialect>,
    semaphore: Arc<Semaphore>,
    resolver: Arc<Option<TokioAsyncResolver>>,
    ttl: u8,
    attempt: u8,
) -> Result<(), TraceError> {
    let cfg = &session.config;

    // Fast path: the TTL may have filled up while this probe was queued.
    if session.result.ttl_complete(ttl, cfg.num_measurements) {
        return Ok(());
    }

    let _permit = tokio::select! {
        _ = session.run.cancelled() => return Ok(()),
        permit = semaphore.acquire() => match permit {
            Ok(permit) => permit,
            Err(_) => return Ok(()),
        },
    };

    // Re-check after the semaphore wait: concurrent probes may have finished
    // the TTL or established a nearer final hop in the meantime.
    if session.final_hop.skips(ttl)
        || session.result.ttl_complete(ttl, cfg.num_measurements)
    {
        return Ok(());
    }

    let seq = dialect.encode_seq(ttl, attempt);
    let mut reply_rx = session.registry.register(seq);
    let _cleanup = session.registry.removal_guard(seq);

    let start = dialect.dispatch_probe(ttl, attempt, seq)?;
    trace!(ttl, attempt, seq, "probe sent");

    tokio::select! {
        _ = session.run.cancelled() => Ok(()),
        reply = reply_rx.recv() => {
            let Some(reply) = reply else { return Ok(()) };
            let rtt = start.elapsed();
            if session.final_hop.skips(ttl) {
                return Ok(());
            }
            if reply.peer == cfg.dest_ip {
                session.final_hop.observe(ttl);
            }
            let mut hop = Hop::received(ttl, reply.peer, rtt, reply.mpls, &cfg.lang);
            enrich(&session, &resolver, &mut hop).await;
            session
                .result
                .add(hop, cfg.num_measurements, cfg.max_attempts);
            Ok(())
        }
        _ = tokio::time::sleep(cfg.timeout) => {
            if session.final_hop.skips(ttl) {
                return Ok(());
            }
            trace!(ttl, attempt, seq, "probe timed out");
            session
                .result
                .add(Hop::timed_out(ttl, &cfg.lang), cfg.num_measurements, cfg.max_attempts);
            Ok(())
        }
    }
}

/// Attaches reverse-DNS and geo data to a freshly recorded hop.
async fn enrich(
    session: &TraceSession,
    resolver: &Arc<Option<TokioAsyncResolver>>,
    hop: &mut Hop,
) {
    let cfg = &session.config;
    let Some(addr) = hop.address else { return };

    match cfg.rdns {
        RdnsPolicy::Off => {}
        RdnsPolicy::Wait => {
            if let Some(resolver) = resolver.as_ref() {
                hop.hostname = reverse_name(resolver, addr).await;
            }
        }
        RdnsPolicy::Lazy => {
            // Warm the resolver cache without holding the hop for the answer.
            if let Some(resolver) = resolver.as_ref() {
                let resolver = resolver.clone();
                tokio::spawn(async move {
                    let _ = resolver.reverse_lookup(addr).await;
                });
            }
        }
    }

    if let Some(geo) = &cfg.geo {
        match geo
            .lookup(addr, cfg.timeout, &cfg.lang, cfg.dn42, false)
            .await
        {
            Ok(data) => hop.geo = Some(data),
            Err(err) => trace!(error = %err, %addr, "geo lookup failed"),
        }
    }
}

async fn reverse_name(resolver: &TokioAsyncResolver, addr: IpAddr) -> Option<String> {
    match resolver.reverse_lookup(addr).await {
        Ok(names) => names
            .iter()
            .next()
            .map(|name| name.to_string().trim_end_matches('.').to_string()),
        Err(_) => None,
    }
}

/// Polls the result and delivers completed TTLs to the printer callbacks in
/// order; flags natural completion once the printable TTL reaches the final
/// hop or the hop limit.
fn spawn_printer(session: TraceSession) {
    let tracker = session.tracker.clone();
    tracker.spawn(async move {
        let cfg = session.config.clone();
        let mut printable = cfg.begin_hop - 1;
        let mut ticker = tokio::time::interval(PRINT_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if let Some(async_printer) = &cfg.async_printer {
                async_printer(&session.result);
            }

            if session
                .result
                .ttl_complete(printable + 1, cfg.num_measurements)
            {
                printable += 1;
                if let Some(realtime_printer) = &cfg.realtime_printer {
                    realtime_printer(&session.result, printable);
                }
                let reached_final = session
                    .final_hop
                    .get()
                    .is_some_and(|final_ttl| printable >= final_ttl);
                if reached_final || printable >= cfg.max_hops {
                    session.run.cancel_with(EndCause::NaturalDone);
                    return;
                }
            }

            tokio::select! {
                _ = session.run.cancelled() => return,
                _ = ticker.tick() => {}
            }
        }
    });
}
