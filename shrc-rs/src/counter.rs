use std::process::abort;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts above this bound abort the process rather than wrap around.
const MAX_REFCOUNT: usize = isize::MAX as usize;

/// The heap-allocated counter shared by every handle of one family.
///
/// A fresh counter holds no reference. The constructing handle registers
/// itself with [`Counter::init`] before the counter becomes reachable from
/// any other handle.
pub(crate) struct Counter {
    cnt: AtomicUsize,
}

impl Counter {
    #[inline(always)]
    pub fn new() -> Self {
        Self {
            cnt: AtomicUsize::new(0),
        }
    }

    /// Registers the first owner.
    #[inline(always)]
    pub fn init(&self) {
        let prev = self.cnt.fetch_add(1, Ordering::Relaxed);
        debug_assert_eq!(prev, 0, "counter initialized twice");
    }

    /// Registers one more owner.
    ///
    /// Only a live handle can be copied, and that handle already keeps the
    /// counter alive, so nothing has to be ordered against this increment.
    #[inline(always)]
    pub fn increment(&self) {
        if self.cnt.fetch_add(1, Ordering::Relaxed) > MAX_REFCOUNT {
            abort();
        }
    }

    /// Drops one owner. Returns true if it was the last one, in which case the
    /// caller must free the payload and this counter.
    #[inline(always)]
    pub fn decrement(&self) -> bool {
        // Acquire-release: the thread that observes zero must see every access
        // other owners made to the payload before their own decrements.
        let prev = self.cnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "counter released below zero");
        prev == 1
    }

    #[inline(always)]
    pub fn load(&self, order: Ordering) -> usize {
        self.cnt.load(order)
    }
}
