//! TCP SYN tracer variant.

pub mod packet;
mod tracer;

pub use tracer::{recover_seq, TcpTracer};
