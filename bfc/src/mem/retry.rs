use crate::device::DevicePtr;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(512);

/// Blocks failed allocations until memory is returned or a deadline passes.
#[derive(Debug, Default)]
pub(super) struct AllocatorRetry {
    mu: Mutex<()>,
    memory_returned: Condvar,
}

impl AllocatorRetry {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Calls `alloc_func(alignment, num_bytes, verbose_failure)` until it
    /// succeeds. Between attempts waits for a deallocation, with waits growing
    /// from 1ms. Once `max_wait` has elapsed since the first failure, makes a
    /// last verbose attempt and returns whatever it gives.
    pub(super) fn allocate_raw<F>(
        &self,
        alloc_func: F,
        max_wait: Duration,
        alignment: usize,
        num_bytes: usize,
    ) -> Option<DevicePtr>
    where
        F: Fn(usize, usize, bool) -> Option<DevicePtr>,
    {
        if num_bytes == 0 {
            return None;
        }
        let mut deadline: Option<Instant> = None;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if let Some(ptr) = alloc_func(alignment, num_bytes, false) {
                return Some(ptr);
            }
            let now = Instant::now();
            let deadline = *deadline.get_or_insert(now + max_wait);
            if now >= deadline {
                return alloc_func(alignment, num_bytes, true);
            }
            let wait = backoff.min(deadline - now);
            let guard = self.mu.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = self
                .memory_returned
                .wait_timeout(guard, wait)
                .unwrap_or_else(PoisonError::into_inner);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    pub(super) fn notify_dealloc(&self) {
        let _guard = self.mu.lock().unwrap_or_else(PoisonError::into_inner);
        self.memory_returned.notify_all();
    }
}
