//! Core types, traits, and the probe scheduler for pathtrace.
//!
//! This crate provides the protocol-independent pieces of the tracing engine:
//!
//! - [`TraceConfig`], [`Method`] and the rest of the data model
//! - [`TraceError`] for error handling
//! - [`TraceResult`] with per-TTL hop slots
//! - [`InflightRegistry`] mapping probe sequences to reply channels
//! - [`scheduler`] driving TTL fan-out, pacing and timeouts over a
//!   [`ProbeDialect`] implementation

pub mod error;
pub mod final_hop;
pub mod hop;
pub mod inflight;
pub mod result;
pub mod run;
pub mod scheduler;
pub mod types;

pub use error::TraceError;
pub use final_hop::FinalHop;
pub use hop::{Hop, HopError, IpGeoData, IpGeoSource, MplsLabel};
pub use inflight::{InflightRegistry, ProbeReply, SeqKey};
pub use result::TraceResult;
pub use run::{EndCause, RunToken};
pub use scheduler::{ProbeDialect, TraceSession};
pub use types::{AsyncPrinter, IcmpMode, Method, RdnsPolicy, RealtimePrinter, TraceConfig};
