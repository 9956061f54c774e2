//! Monotone integer fences between the IO worker and CPU consumers.

use std::sync::{Arc, Condvar, Mutex};

/// Fence value the IO worker signals when it hits a fatal error, so every
/// waiter wakes and can observe the queue's error slot.
pub const FENCE_POISON: u64 = u64::MAX;

struct Inner {
    value: Mutex<u64>,
    cond: Condvar,
}

/// A monotonically-advancing barrier. The IO worker signals values as
/// commands complete; CPU kernels wait for the value they need. Cloning
/// shares the underlying fence.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<Inner>,
}

impl Fence {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                value: Mutex::new(0),
                cond: Condvar::new(),
            }),
        }
    }

    /// Rewind to `value`. Only valid while no IO referencing this fence is
    /// in flight.
    pub fn reset(&self, value: u64) {
        *self.inner.value.lock().unwrap() = value;
    }

    /// Raise the fence to at least `value`.
    pub fn signal(&self, value: u64) {
        let mut current = self.inner.value.lock().unwrap();
        if value > *current {
            *current = value;
            self.inner.cond.notify_all();
        }
    }

    /// Block until the fence reaches `value`.
    pub fn wait(&self, value: u64) {
        let mut current = self.inner.value.lock().unwrap();
        while *current < value {
            current = self.inner.cond.wait(current).unwrap();
        }
    }

    pub fn value(&self) -> u64 {
        *self.inner.value.lock().unwrap()
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}
