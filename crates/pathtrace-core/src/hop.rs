//! Measurement outcomes and their enrichment interfaces.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Non-fatal failure recorded on a hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HopError {
    /// No reply arrived within the per-probe timeout.
    HopLimitTimeout,
}

impl std::fmt::Display for HopError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HopError::HopLimitTimeout => write!(f, "hop limit timeout"),
        }
    }
}

/// One entry of an MPLS label stack quoted in an ICMP extension (RFC 4950).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MplsLabel {
    /// 20-bit label value.
    pub label: u32,
    /// 3-bit traffic class bits.
    pub tc: u8,
    /// Bottom-of-stack flag.
    pub bottom: bool,
    /// Label TTL.
    pub ttl: u8,
}

impl MplsLabel {
    /// Decodes one 4-byte label stack entry.
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let word = u32::from_be_bytes(*bytes);
        Self {
            label: word >> 12,
            tc: ((word >> 9) & 0x07) as u8,
            bottom: (word >> 8) & 0x01 == 1,
            ttl: (word & 0xFF) as u8,
        }
    }
}

/// Geolocation data attached to a hop by an [`IpGeoSource`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpGeoData {
    pub asn: String,
    pub country: String,
    pub province: String,
    pub city: String,
    pub district: String,
    pub owner: String,
    pub isp: String,
    pub domain: String,
    pub lat: f64,
    pub lng: f64,
}

/// Pluggable IP-geolocation provider.
///
/// Lookup failures are swallowed by the engine; the hop is kept unannotated.
/// `dn42` signals that DN42 addressing conventions apply to the queried
/// address; providers without DN42 data may ignore it.
#[async_trait]
pub trait IpGeoSource: Send + Sync {
    async fn lookup(
        &self,
        ip: IpAddr,
        timeout: Duration,
        lang: &str,
        dn42: bool,
        json_mode: bool,
    ) -> Result<IpGeoData, crate::TraceError>;
}

/// One measurement outcome for a single TTL/attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hop {
    /// Whether a reply was correlated to the probe.
    pub success: bool,
    /// The replying router or destination, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,
    /// TTL the probe was sent with.
    pub ttl: u8,
    /// Round-trip time; zero for timeouts.
    pub rtt: Duration,
    /// Failure kind for unsuccessful measurements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<HopError>,
    /// MPLS label stack quoted by the replying router.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mpls: Option<Vec<MplsLabel>>,
    /// Reverse-DNS name of the replying address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Geolocation annotation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo: Option<IpGeoData>,
    /// Language tag the run was configured with.
    pub lang: String,
}

impl Hop {
    /// A successful measurement for `ttl` answered by `address`.
    pub fn received(
        ttl: u8,
        address: IpAddr,
        rtt: Duration,
        mpls: Option<Vec<MplsLabel>>,
        lang: &str,
    ) -> Self {
        Self {
            success: true,
            address: Some(address),
            ttl,
            rtt,
            error: None,
            mpls,
            hostname: None,
            geo: None,
            lang: lang.to_string(),
        }
    }

    /// A timed-out measurement for `ttl`.
    pub fn timed_out(ttl: u8, lang: &str) -> Self {
        Self {
            success: false,
            address: None,
            ttl,
            rtt: Duration::ZERO,
            error: Some(HopError::HopLimitTimeout),
            mpls: None,
            hostname: None,
            geo: None,
            lang: lang.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mpls_label_decode() {
        // label 0x12345, tc 3, bottom of stack, ttl 64
        let word: u32 = (0x12345 << 12) | (3 << 9) | (1 << 8) | 64;
        let label = MplsLabel::from_bytes(&word.to_be_bytes());
        assert_eq!(label.label, 0x12345);
        assert_eq!(label.tc, 3);
        assert!(label.bottom);
        assert_eq!(label.ttl, 64);
    }

    #[test]
    fn test_mpls_label_not_bottom() {
        let word: u32 = (7 << 12) | 255;
        let label = MplsLabel::from_bytes(&word.to_be_bytes());
        assert_eq!(label.label, 7);
        assert_eq!(label.tc, 0);
        assert!(!label.bottom);
        assert_eq!(label.ttl, 255);
    }

    #[test]
    fn test_timed_out_hop() {
        let hop = Hop::timed_out(7, "en");
        assert!(!hop.success);
        assert_eq!(hop.ttl, 7);
        assert_eq!(hop.error, Some(HopError::HopLimitTimeout));
        assert!(hop.address.is_none());
    }
}
