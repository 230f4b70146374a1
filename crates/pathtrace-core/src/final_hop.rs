//! Lock-free tracking of the smallest TTL the destination answered from.

use std::sync::atomic::{AtomicI32, Ordering};

const UNSET: i32 = -1;

/// Monotonically decreasing final TTL, starting at an unset sentinel.
///
/// Replies from the destination race each other; the compare-and-swap loop
/// keeps only the smallest observed TTL.
#[derive(Debug)]
pub struct FinalHop(AtomicI32);

impl Default for FinalHop {
    fn default() -> Self {
        Self(AtomicI32::new(UNSET))
    }
}

impl FinalHop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowers the final TTL to `ttl` if it improves on the current value.
    pub fn observe(&self, ttl: u8) {
        let ttl = ttl as i32;
        loop {
            let current = self.0.load(Ordering::Acquire);
            if current != UNSET && ttl >= current {
                return;
            }
            if self
                .0
                .compare_exchange(current, ttl, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// The established final TTL, if any.
    pub fn get(&self) -> Option<u8> {
        let v = self.0.load(Ordering::Acquire);
        (v != UNSET).then_some(v as u8)
    }

    /// Whether `ttl` lies beyond an established final hop.
    pub fn skips(&self, ttl: u8) -> bool {
        self.get().is_some_and(|f| ttl > f)
    }
}
