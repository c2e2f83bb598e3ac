//! Counting semaphore bounding the number of buffers in flight

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Counting semaphore built on a mutex and a condition variable.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    condvar: Condvar,
    capacity: usize,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Mutex::new(capacity),
            condvar: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        *self.permits.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Takes a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        if *permits > 0 {
            *permits -= 1;
            true
        } else {
            false
        }
    }

    /// Waits up to `timeout` for a permit.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());

        while *permits == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            permits = match self.condvar.wait_timeout(permits, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        *permits -= 1;
        true
    }

    /// Returns a permit. Never exceeds the capacity.
    pub fn release(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        if *permits < self.capacity {
            *permits += 1;
            self.condvar.notify_one();
        } else {
            log::warn!("semaphore release past capacity {}", self.capacity);
        }
    }

    /// Restores every permit.
    pub fn reset(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        *permits = self.capacity;
        self.condvar.notify_all();
    }
}
