//! Error types for trace operations.

use std::net::IpAddr;
use thiserror::Error;

/// Main error type for trace operations.
#[derive(Error, Debug)]
pub enum TraceError {
    // Socket/IO errors
    #[error("Failed to create socket: {0}")]
    SocketCreation(#[source] std::io::Error),

    #[error("Failed to bind to address {addr}: {source}")]
    SocketBind {
        addr: IpAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open capture handle: {0}")]
    CaptureOpen(String),

    #[error("Read timeout exceeded")]
    ReadTimeout,

    #[error("Probe write failed: {0}")]
    WriteFailed(#[source] std::io::Error),

    // Packet errors
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Failed to parse {layer} layer: {reason}")]
    PacketParseFailed { layer: &'static str, reason: String },

    #[error("Packet did not match any outstanding probe")]
    PacketMismatch,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    // Configuration errors
    #[error("Invalid source address {addr}: {reason}")]
    InvalidSourceAddress { addr: String, reason: String },

    #[error("Address family mismatch: source {src}, destination {dest}")]
    AddressFamilyMismatch { src: IpAddr, dest: IpAddr },

    #[error("Invalid hop range: first={begin}, max={max}")]
    InvalidHopRange { begin: u8, max: u8 },

    #[error("Unknown trace method: {0}")]
    UnknownMethod(String),

    #[error("Failed to resolve hostname {hostname}: {reason}")]
    ResolveFailed { hostname: String, reason: String },

    // Lifecycle errors
    #[error("Tracer instance was already executed")]
    AlreadyExecuted,

    #[error("Trace cancelled")]
    Cancelled,

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TraceError {
    /// Returns true if this error is recoverable inside a read loop.
    ///
    /// Raw sockets and capture handles deliver traffic that has nothing to do
    /// with the trace in progress; read loops must keep going past these
    /// instead of tearing the run down.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ReadTimeout
                | Self::PacketMismatch
                | Self::MalformedPacket(_)
                | Self::PacketParseFailed { .. }
                | Self::PacketTooShort { .. }
        )
    }
}

impl From<std::io::Error> for TraceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TraceError::ReadTimeout,
            std::io::ErrorKind::WouldBlock => TraceError::ReadTimeout,
            _ => TraceError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(TraceError::ReadTimeout.is_retryable());
        assert!(TraceError::PacketMismatch.is_retryable());
        assert!(TraceError::MalformedPacket("test".into()).is_retryable());
        assert!(TraceError::PacketTooShort {
            expected: 20,
            actual: 10
        }
        .is_retryable());
        assert!(!TraceError::AlreadyExecuted.is_retryable());
        assert!(!TraceError::Cancelled.is_retryable());
    }

    #[test]
    fn test_io_error_mapping() {
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "t");
        assert!(matches!(
            TraceError::from(timed_out),
            TraceError::ReadTimeout
        ));

        let would_block = std::io::Error::new(std::io::ErrorKind::WouldBlock, "w");
        assert!(matches!(
            TraceError::from(would_block),
            TraceError::ReadTimeout
        ));
    }
}
