//! Registry of probes awaiting their replies.
//!
//! Probe tasks register a capacity-1 channel under their encoded sequence
//! before the packet leaves the host; correlators dispatch parsed replies into
//! it without blocking. Entries are removed through a drop guard on every
//! probe exit path, so a completed run leaves the registry empty.

use crate::hop::MplsLabel;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::trace;

/// Probe sequence key. ICMP and UDP encodings occupy the low 16 bits, TCP
/// sequence numbers use the full width.
pub type SeqKey = u32;

/// Reply payload handed from a correlator to the waiting probe.
#[derive(Debug, Clone)]
pub struct ProbeReply {
    /// Address the reply came from.
    pub peer: IpAddr,
    /// MPLS label stack quoted in the ICMP extension area, if any.
    pub mpls: Option<Vec<MplsLabel>>,
}

/// Mapping from probe sequence to its single-use reply channel.
#[derive(Debug, Default)]
pub struct InflightRegistry {
    map: RwLock<HashMap<SeqKey, mpsc::Sender<ProbeReply>>>,
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel for `seq` and returns the receiving end.
    ///
    /// A stale entry under the same key is replaced; its receiver observes a
    /// closed channel.
    pub fn register(&self, seq: SeqKey) -> mpsc::Receiver<ProbeReply> {
        let (tx, rx) = mpsc::channel(1);
        self.map.write().unwrap().insert(seq, tx);
        rx
    }

    /// Dispatches a reply to the probe waiting on `seq`.
    ///
    /// Returns false when no probe is waiting (late reply) or the channel is
    /// already full (duplicate reply); both are dropped silently.
    pub fn dispatch(&self, seq: SeqKey, reply: ProbeReply) -> bool {
        let map = self.map.read().unwrap();
        let Some(tx) = map.get(&seq) else {
            trace!(seq, "dropping reply with no outstanding probe");
            return false;
        };
        match tx.try_send(reply) {
            Ok(()) => true,
            Err(_) => {
                trace!(seq, "dropping duplicate reply");
                false
            }
        }
    }

    /// Removes the entry for `seq`.
    pub fn remove(&self, seq: SeqKey) {
        self.map.write().unwrap().remove(&seq);
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().unwrap().is_empty()
    }

    /// Returns a guard removing `seq` when dropped.
    pub fn removal_guard(self: &Arc<Self>, seq: SeqKey) -> InflightGuard {
        InflightGuard {
            registry: Arc::clone(self),
            seq,
        }
    }
}

/// Removes an in-flight entry on drop, whichever way the probe path exits.
pub struct InflightGuard {
    registry: Arc<InflightRegistry>,
    seq: SeqKey,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.registry.remove(self.seq);
    }
}
