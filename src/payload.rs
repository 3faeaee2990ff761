use crossbeam_utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts how many payloads were built and how many were dropped.
///
/// A run is sound when both numbers agree after every handle is gone.
#[derive(Default)]
pub struct Tracker {
    constructed: CachePadded<AtomicUsize>,
    dropped: CachePadded<AtomicUsize>,
}

impl Tracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn audit(&self) -> Audit {
        Audit {
            constructed: self.constructed.load(Ordering::Acquire),
            dropped: self.dropped.load(Ordering::Acquire),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Audit {
    pub constructed: usize,
    pub dropped: usize,
}

impl Audit {
    pub fn is_balanced(&self) -> bool {
        self.constructed == self.dropped
    }
}

impl fmt::Display for Audit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "constructed: {}, dropped: {}",
            self.constructed, self.dropped
        )
    }
}

/// The object every family of handles shares during a run.
pub struct Payload {
    pub key: usize,
    pub value: usize,
    tracker: Arc<Tracker>,
}

impl Payload {
    pub fn new(key: usize, tracker: &Arc<Tracker>) -> Self {
        tracker.constructed.fetch_add(1, Ordering::Relaxed);
        Self {
            key,
            value: key,
            tracker: tracker.clone(),
        }
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        self.tracker.dropped.fetch_add(1, Ordering::Release);
    }
}
