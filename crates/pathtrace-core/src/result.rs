//! Shared trace result with per-TTL hop slots.

use crate::hop::Hop;
use crate::TraceError;
use std::sync::RwLock;

/// Ordered TTL slots, each holding the measurements recorded for that TTL.
///
/// Only [`add`](TraceResult::add) and [`reduce`](TraceResult::reduce) mutate
/// the slots; everything else takes the read side of the lock.
#[derive(Debug, Default)]
pub struct TraceResult {
    hops: RwLock<Vec<Vec<Hop>>>,
}

impl TraceResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-sizes the slots for a run of `max_hops` TTLs.
    ///
    /// Fails if the result already holds slots: a tracer instance must not be
    /// executed twice.
    pub fn init(&self, max_hops: u8) -> Result<(), TraceError> {
        let mut hops = self.hops.write().unwrap();
        if !hops.is_empty() {
            return Err(TraceError::AlreadyExecuted);
        }
        hops.resize_with(max_hops as usize, Vec::new);
        Ok(())
    }

    /// Records a measurement in its TTL slot.
    ///
    /// Successful hops are capped at `num_measurements` per slot; timeouts may
    /// pad the slot further, up to `max_attempts` entries in total.
    pub fn add(&self, hop: Hop, num_measurements: usize, max_attempts: usize) {
        let mut hops = self.hops.write().unwrap();
        let Some(slot) = (hop.ttl as usize)
            .checked_sub(1)
            .and_then(|idx| hops.get_mut(idx))
        else {
            return;
        };

        let successes = slot.iter().filter(|h| h.success).count();
        if hop.success {
            if successes >= num_measurements {
                return;
            }
        } else if successes >= num_measurements || slot.len() >= max_attempts {
            return;
        }
        slot.push(hop);
    }

    /// Truncates the result to `final_ttl` slots.
    pub fn reduce(&self, final_ttl: u8) {
        let mut hops = self.hops.write().unwrap();
        hops.truncate(final_ttl as usize);
    }

    /// Whether the slot for `ttl` holds at least `num_measurements` entries.
    pub fn ttl_complete(&self, ttl: u8, num_measurements: usize) -> bool {
        if ttl == 0 {
            return false;
        }
        let hops = self.hops.read().unwrap();
        hops.get(ttl as usize - 1)
            .map(|slot| slot.len() >= num_measurements)
            .unwrap_or(false)
    }

    /// Number of TTL slots currently held.
    pub fn len(&self) -> usize {
        self.hops.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.read().unwrap().is_empty()
    }

    /// Clones the measurements of one TTL slot (1-based).
    pub fn ttl_hops(&self, ttl: u8) -> Vec<Hop> {
        if ttl == 0 {
            return Vec::new();
        }
        let hops = self.hops.read().unwrap();
        hops.get(ttl as usize - 1).cloned().unwrap_or_default()
    }

    /// Clones the full slot table.
    pub fn snapshot(&self) -> Vec<Vec<Hop>> {
        self.hops.read().unwrap().clone()
    }

    /// Serializes the slot table as pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.snapshot())
    }
}
