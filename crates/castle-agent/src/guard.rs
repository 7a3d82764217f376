//! Coalescing of overlapping reconcile requests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Serializes one kind of configuration work on a node.
///
/// Every request bumps a counter. The request that finds it at zero gets a
/// [`ConfigHold`] and does the work; the others return at once and are
/// remembered as pending so the holder can loop over them. The holder only
/// lets go through [`ConfigHold::finish`], which hands the hold back when a
/// request slipped in.
#[derive(Debug, Clone, Default)]
pub struct ConfigGuard {
    counter: Arc<AtomicUsize>,
}

impl ConfigGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start work, or `None` if work is already in flight
    #[must_use]
    pub fn try_start(&self) -> Option<ConfigHold> {
        if self.counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Some(ConfigHold {
                counter: Arc::clone(&self.counter),
                released: false,
            })
        } else {
            None
        }
    }

    #[must_use]
    pub fn in_flight(&self) -> bool {
        self.counter.load(Ordering::SeqCst) > 0
    }
}

/// Ownership of in-flight work; dropping it without [`finish`](Self::finish)
/// releases the guard as well
#[derive(Debug)]
pub struct ConfigHold {
    counter: Arc<AtomicUsize>,
    released: bool,
}

impl ConfigHold {
    /// Release the guard if no request arrived since the work started.
    /// Otherwise the pending requests are cleared and the hold is returned
    /// for another round.
    #[must_use]
    pub fn finish(mut self) -> Option<Self> {
        if self
            .counter
            .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.released = true;
            None
        } else {
            self.counter.store(1, Ordering::SeqCst);
            Some(self)
        }
    }
}

impl Drop for ConfigHold {
    fn drop(&mut self) {
        if !self.released {
            self.counter.store(0, Ordering::SeqCst);
        }
    }
}
