//! Cooperative read loop over a packet source.

use crate::source::PacketSource;
use crate::MAX_DATAGRAM;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Capacity of the listener output channel.
const CHANNEL_CAPACITY: usize = 64;

/// One inbound packet as delivered by a listener.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub bytes: Vec<u8>,
    pub peer: IpAddr,
    pub at: Instant,
}

/// Spawns a reader over `source`, forwarding packets until cancellation.
///
/// The loop runs on a dedicated thread because source reads are blocking;
/// their short internal timeout bounds how long cancellation can go
/// unnoticed. Closing the returned receiver also stops the reader.
pub fn spawn_listener<S>(source: Arc<S>, cancel: CancellationToken) -> mpsc::Receiver<ReceivedMessage>
where
    S: PacketSource + ?Sized + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    std::thread::spawn(move || {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match source.recv(&mut buf) {
                Ok((len, peer)) => {
                    let msg = ReceivedMessage {
                        bytes: buf[..len].to_vec(),
                        peer,
                        at: Instant::now(),
                    };
                    if tx.blocking_send(msg).is_err() {
                        break;
                    }
                }
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut
                        || err.kind() == ErrorKind::Interrupted =>
                {
                    continue;
                }
                Err(err) => {
                    if !cancel.is_cancelled() {
                        warn!(error = %err, "packet listener read failed");
                    }
                    break;
                }
            }
        }
        if let Err(err) = source.close() {
            trace!(error = %err, "packet source close failed");
        }
    });
    rx
}
