//! Packet I/O abstraction for pathtrace.
//!
//! Provides the ingress/egress traits the tracer variants are written
//! against, the listener loop feeding correlators, frame parsing for ICMP
//! envelopes and TCP replies, and the per-OS backend constructors.

pub mod listener;
pub mod parser;
pub mod platform;
pub mod sink;
pub mod source;

pub use listener::{spawn_listener, ReceivedMessage};
pub use parser::{
    parse_icmp_frame, parse_tcp_reply, quoted_echo, quoted_tcp_seq, quoted_udp, IcmpEnvelope,
    IcmpKind, QuotedProbe, TcpReply, UdpQuote,
};
pub use platform::EndpointConfig;
pub use sink::{ProbeSink, TcpChannel};
pub use source::{Framing, PacketSource};

/// Upper bound of a single datagram read.
pub const MAX_DATAGRAM: usize = 65535;
