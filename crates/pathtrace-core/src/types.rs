//! Core configuration types for trace runs.

use crate::hop::IpGeoSource;
use crate::result::TraceResult;
use crate::TraceError;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Probing method for a trace run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[default]
    Icmp,
    Udp,
    Tcp,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Icmp => write!(f, "icmp"),
            Method::Udp => write!(f, "udp"),
            Method::Tcp => write!(f, "tcp"),
        }
    }
}

impl std::str::FromStr for Method {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "icmp" => Ok(Method::Icmp),
            "udp" => Ok(Method::Udp),
            "tcp" => Ok(Method::Tcp),
            _ => Err(TraceError::UnknownMethod(s.to_string())),
        }
    }
}

/// Windows ICMP ingress selection hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IcmpMode {
    /// Probe pcap availability, fall back to a raw socket.
    #[default]
    Auto,
    /// Force the raw-socket backend.
    Socket,
    /// Force the pcap capture backend.
    Pcap,
}

impl From<u8> for IcmpMode {
    fn from(v: u8) -> Self {
        match v {
            1 => IcmpMode::Socket,
            2 => IcmpMode::Pcap,
            _ => IcmpMode::Auto,
        }
    }
}

/// Reverse-DNS enrichment policy for recorded hops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RdnsPolicy {
    /// No reverse lookups.
    Off,
    /// Fire-and-forget: the lookup is started but the hop is not held for it.
    #[default]
    Lazy,
    /// Block the probe task until the lookup resolves or fails.
    Wait,
}

/// Realtime printer callback, invoked once per fully-measured TTL in order.
pub type RealtimePrinter = Arc<dyn Fn(&TraceResult, u8) + Send + Sync>;

/// Async printer callback, invoked on every poller tick with the live result.
pub type AsyncPrinter = Arc<dyn Fn(&TraceResult) + Send + Sync>;

/// Immutable configuration for a single trace run.
#[derive(Clone)]
pub struct TraceConfig {
    /// Source address; resolved from a dummy connection when unset.
    pub src_addr: Option<IpAddr>,
    /// Source port; 0 means an ephemeral port is allocated for the run.
    pub src_port: u16,
    /// Destination IP address.
    pub dest_ip: IpAddr,
    /// Destination port (TCP/UDP).
    pub dest_port: u16,
    /// First TTL to probe.
    pub begin_hop: u8,
    /// Highest TTL to probe.
    pub max_hops: u8,
    /// Pacing between consecutive probes inside one TTL group.
    pub packet_interval: Duration,
    /// Pacing between consecutive TTL group launches.
    pub ttl_interval: Duration,
    /// Measurements wanted per TTL.
    pub num_measurements: usize,
    /// Upper bound on attempts per TTL, timeouts included.
    pub max_attempts: usize,
    /// Concurrent in-flight probe cap.
    pub parallel_requests: usize,
    /// Per-probe reply timeout, measured from the packet write.
    pub timeout: Duration,
    /// Probe payload size in bytes.
    pub pkt_size: usize,
    /// Reverse-DNS enrichment policy.
    pub rdns: RdnsPolicy,
    /// Language tag forwarded to geo lookups and recorded on hops.
    pub lang: String,
    /// Windows ICMP ingress mode hint.
    pub icmp_mode: IcmpMode,
    /// Whether DN42 addressing conventions apply to enrichment.
    pub dn42: bool,
    /// Disables MPLS extension extraction from ICMP errors.
    pub disable_mpls: bool,
    /// Interface to bind the ingress socket to (macOS).
    pub interface: Option<String>,
    /// IP-geolocation provider; hops stay unannotated without one.
    pub geo: Option<Arc<dyn IpGeoSource>>,
    /// Realtime per-TTL printer.
    pub realtime_printer: Option<RealtimePrinter>,
    /// Whole-result printer invoked on every poller tick.
    pub async_printer: Option<AsyncPrinter>,
}

impl std::fmt::Debug for TraceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceConfig")
            .field("src_addr", &self.src_addr)
            .field("src_port", &self.src_port)
            .field("dest_ip", &self.dest_ip)
            .field("dest_port", &self.dest_port)
            .field("begin_hop", &self.begin_hop)
            .field("max_hops", &self.max_hops)
            .field("packet_interval", &self.packet_interval)
            .field("ttl_interval", &self.ttl_interval)
            .field("num_measurements", &self.num_measurements)
            .field("max_attempts", &self.max_attempts)
            .field("parallel_requests", &self.parallel_requests)
            .field("timeout", &self.timeout)
            .field("pkt_size", &self.pkt_size)
            .field("rdns", &self.rdns)
            .field("lang", &self.lang)
            .field("icmp_mode", &self.icmp_mode)
            .field("dn42", &self.dn42)
            .field("disable_mpls", &self.disable_mpls)
            .field("interface", &self.interface)
            .finish_non_exhaustive()
    }
}

impl TraceConfig {
    /// Creates a config for `dest_ip` with the standard defaults.
    pub fn new(dest_ip: IpAddr) -> Self {
        Self {
            src_addr: None,
            src_port: 0,
            dest_ip,
            dest_port: 80,
            begin_hop: 1,
            max_hops: 30,
            packet_interval: Duration::from_millis(50),
            ttl_interval: Duration::from_millis(50),
            num_measurements: 3,
            max_attempts: 0,
            parallel_requests: 18,
            timeout: Duration::from_millis(1000),
            pkt_size: 52,
            rdns: RdnsPolicy::default(),
            lang: "en".to_string(),
            icmp_mode: IcmpMode::Auto,
            dn42: false,
            disable_mpls: false,
            interface: None,
            geo: None,
            realtime_printer: None,
            async_printer: None,
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), TraceError> {
        if self.begin_hop == 0 || self.begin_hop > self.max_hops {
            return Err(TraceError::InvalidHopRange {
                begin: self.begin_hop,
                max: self.max_hops,
            });
        }
        if self.num_measurements == 0 {
            return Err(TraceError::Internal(
                "num_measurements must be at least 1".to_string(),
            ));
        }
        if self.parallel_requests == 0 {
            return Err(TraceError::Internal(
                "parallel_requests must be at least 1".to_string(),
            ));
        }
        if let Some(src) = self.src_addr {
            if src.is_ipv4() != self.dest_ip.is_ipv4() {
                return Err(TraceError::AddressFamilyMismatch {
                    src,
                    dest: self.dest_ip,
                });
            }
        }
        Ok(())
    }

    /// Normalizes boundary values for the given method.
    ///
    /// UDP payloads carry the probe encoding in their first two bytes, so a
    /// smaller payload is bumped to 2. `max_attempts` of 0 means auto (twice
    /// the measurement count); anything above 255 is clamped since the
    /// attempt index shares a byte with the TTL in the sequence encodings.
    pub fn normalize(&mut self, method: Method) {
        if method == Method::Udp && self.pkt_size < 2 {
            self.pkt_size = 2;
        }
        if self.max_attempts == 0 {
            self.max_attempts = self.num_measurements * 2;
        }
        if self.max_attempts < self.num_measurements {
            self.max_attempts = self.num_measurements;
        }
        if self.max_attempts > 255 {
            self.max_attempts = 255;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn config() -> TraceConfig {
        TraceConfig::new(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)))
    }

    #[test]
    fn test_method_from_str() {
        assert_eq!("icmp".parse::<Method>().unwrap(), Method::Icmp);
        assert_eq!("UDP".parse::<Method>().unwrap(), Method::Udp);
        assert_eq!("Tcp".parse::<Method>().unwrap(), Method::Tcp);
        assert!("invalid".parse::<Method>().is_err());
    }

    #[test]
    fn test_icmp_mode_from_hint() {
        assert_eq!(IcmpMode::from(0), IcmpMode::Auto);
        assert_eq!(IcmpMode::from(1), IcmpMode::Socket);
        assert_eq!(IcmpMode::from(2), IcmpMode::Pcap);
        assert_eq!(IcmpMode::from(9), IcmpMode::Auto);
    }

    #[test]
    fn test_validate_hop_range() {
        let mut cfg = config();
        cfg.begin_hop = 31;
        cfg.max_hops = 30;
        assert!(matches!(
            cfg.validate(),
            Err(TraceError::InvalidHopRange { .. })
        ));
    }

    #[test]
    fn test_validate_family_mismatch() {
        let mut cfg = config();
        cfg.src_addr = Some("::1".parse().unwrap());
        assert!(matches!(
            cfg.validate(),
            Err(TraceError::AddressFamilyMismatch { .. })
        ));
    }

    #[test]
    fn test_normalize_udp_payload_floor() {
        let mut cfg = config();
        cfg.pkt_size = 0;
        cfg.normalize(Method::Udp);
        assert_eq!(cfg.pkt_size, 2);

        let mut cfg = config();
        cfg.pkt_size = 0;
        cfg.normalize(Method::Icmp);
        assert_eq!(cfg.pkt_size, 0);
    }

    #[test]
    fn test_normalize_max_attempts() {
        let mut cfg = config();
        cfg.normalize(Method::Icmp);
        assert_eq!(cfg.max_attempts, 6);

        let mut cfg = config();
        cfg.max_attempts = 1000;
        cfg.normalize(Method::Icmp);
        assert_eq!(cfg.max_attempts, 255);

        let mut cfg = config();
        cfg.max_attempts = 2;
        cfg.num_measurements = 5;
        cfg.normalize(Method::Icmp);
        assert_eq!(cfg.max_attempts, 5);
    }
}
