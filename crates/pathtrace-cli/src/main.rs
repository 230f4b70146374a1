//! Command-line front-end for pathtrace.

mod runner;

use clap::Parser;
use pathtrace_core::{IcmpMode, Method, RdnsPolicy, TraceConfig, TraceError, TraceResult};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Visual route tracing engine.
#[derive(Parser, Debug)]
#[command(name = "pathtrace")]
#[command(version)]
#[command(about = "Trace the route to a host with ICMP, UDP or TCP probes")]
pub struct Args {
    /// Target hostname or IP address.
    #[arg(required = true)]
    pub target: String,

    /// Use TCP SYN probes (default destination port 80).
    #[arg(short = 'T', long, conflicts_with = "udp")]
    pub tcp: bool,

    /// Use UDP probes (default destination port 33494).
    #[arg(short = 'U', long)]
    pub udp: bool,

    /// Destination port; 0 picks the method default.
    #[arg(short, long, default_value = "0")]
    pub port: u16,

    /// First TTL to probe.
    #[arg(short = 'f', long = "first", default_value = "1")]
    pub first: u8,

    /// Maximum TTL to probe.
    #[arg(short = 'm', long = "max-hops", default_value = "30")]
    pub max_hops: u8,

    /// Probes per hop.
    #[arg(short = 'q', long = "queries", default_value = "3")]
    pub queries: usize,

    /// Upper bound on attempts per hop (0 = auto).
    #[arg(long = "max-attempts", default_value = "0")]
    pub max_attempts: usize,

    /// Concurrent probe cap.
    #[arg(long = "parallel-requests", default_value = "18")]
    pub parallel_requests: usize,

    /// Milliseconds between packets of one TTL group.
    #[arg(short = 'z', long = "send-time", default_value = "50")]
    pub send_time: u64,

    /// Milliseconds between TTL group launches.
    #[arg(short = 'i', long = "ttl-time", default_value = "50")]
    pub ttl_time: u64,

    /// Per-probe timeout in milliseconds.
    #[arg(long, default_value = "1000")]
    pub timeout: u64,

    /// Probe payload size in bytes.
    #[arg(long = "psize", default_value = "52")]
    pub psize: usize,

    /// Prefer IPv6 resolution.
    #[arg(short = '6', long)]
    pub ipv6: bool,

    /// Source address to bind.
    #[arg(short = 's', long)]
    pub source: Option<String>,

    /// Source port for outgoing packets (TCP).
    #[arg(long = "source-port", default_value = "0")]
    pub source_port: u16,

    /// Reverse-DNS policy: off, lazy or wait.
    #[arg(long = "rdns", default_value = "lazy")]
    pub rdns: String,

    /// Windows ICMP ingress mode: 0 auto, 1 socket, 2 pcap.
    #[arg(long = "icmp-mode", default_value = "0")]
    pub icmp_mode: u8,

    /// Apply DN42 addressing conventions to enrichment.
    #[arg(long)]
    pub dn42: bool,

    /// Skip MPLS extension extraction.
    #[arg(long = "disable-mpls")]
    pub disable_mpls: bool,

    /// Interface to bind the ingress socket to.
    #[arg(long = "dev")]
    pub interface: Option<String>,

    /// Language tag for geo annotations.
    #[arg(long, default_value = "en")]
    pub lang: String,

    /// Print the populated result as JSON instead of per-hop lines.
    #[arg(long)]
    pub json: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    fn method(&self) -> Method {
        if self.tcp {
            Method::Tcp
        } else if self.udp {
            Method::Udp
        } else {
            Method::Icmp
        }
    }

    fn dest_port(&self) -> u16 {
        if self.port != 0 {
            return self.port;
        }
        match self.method() {
            Method::Udp => 33494,
            _ => 80,
        }
    }

    fn rdns_policy(&self) -> Result<RdnsPolicy, String> {
        match self.rdns.to_lowercase().as_str() {
            "off" => Ok(RdnsPolicy::Off),
            "lazy" => Ok(RdnsPolicy::Lazy),
            "wait" => Ok(RdnsPolicy::Wait),
            other => Err(format!("unknown rdns policy: {other}")),
        }
    }

    async fn to_config(&self) -> Result<TraceConfig, String> {
        let dest_ip = runner::resolve_host(&self.target, self.ipv6)
            .await
            .map_err(|e| e.to_string())?;

        let src_addr = match &self.source {
            Some(addr) => Some(
                addr.parse()
                    .map_err(|_| format!("invalid source address: {addr}"))?,
            ),
            None => None,
        };

        let mut cfg = TraceConfig::new(dest_ip);
        cfg.src_addr = src_addr;
        cfg.src_port = self.source_port;
        cfg.dest_port = self.dest_port();
        cfg.begin_hop = self.first;
        cfg.max_hops = self.max_hops;
        cfg.packet_interval = Duration::from_millis(self.send_time);
        cfg.ttl_interval = Duration::from_millis(self.ttl_time);
        cfg.num_measurements = self.queries;
        cfg.max_attempts = self.max_attempts;
        cfg.parallel_requests = self.parallel_requests;
        cfg.timeout = Duration::from_millis(self.timeout);
        cfg.pkt_size = self.psize;
        cfg.rdns = self.rdns_policy()?;
        cfg.lang = self.lang.clone();
        cfg.icmp_mode = IcmpMode::from(self.icmp_mode);
        cfg.dn42 = self.dn42;
        cfg.disable_mpls = self.disable_mpls;
        cfg.interface = self.interface.clone();
        Ok(cfg)
    }
}

/// Per-TTL line printer for interactive runs.
fn print_ttl(result: &TraceResult, ttl: u8) {
    let mut line = format!("{ttl:3}");
    for hop in result.ttl_hops(ttl) {
        if hop.success {
            let addr = hop
                .address
                .map(|a| a.to_string())
                .unwrap_or_else(|| "?".to_string());
            match &hop.hostname {
                Some(name) => line.push_str(&format!(
                    "  {name} ({addr}) {:.2}ms",
                    hop.rtt.as_secs_f64() * 1000.0
                )),
                None => {
                    line.push_str(&format!("  {addr} {:.2}ms", hop.rtt.as_secs_f64() * 1000.0))
                }
            }
            if let Some(labels) = &hop.mpls {
                for label in labels {
                    line.push_str(&format!(" [MPLS {}]", label.label));
                }
            }
        } else {
            line.push_str("  *");
        }
    }
    println!("{line}");
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match args.to_config().await {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("Error: {err}");
            return ExitCode::FAILURE;
        }
    };

    if !args.json {
        config.realtime_printer = Some(Arc::new(print_ttl));
        println!(
            "pathtrace to {} ({}), {} hops max, {} byte payload",
            args.target, config.dest_ip, config.max_hops, config.pkt_size
        );
    }

    let (result, outcome) = runner::run_trace(args.method(), config).await;

    // An interrupted or faulted run still carries the hops recorded so far;
    // render them before reporting how the run ended.
    if args.json {
        match result.to_json() {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("Failed to serialize result: {err}");
                return ExitCode::FAILURE;
            }
        }
    }

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(TraceError::Cancelled) => {
            eprintln!("Trace interrupted");
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("Trace failed: {err}");
            ExitCode::FAILURE
        }
    }
}
