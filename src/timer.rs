//! Single-shot timer service keyed by absolute microsecond deadlines.
//!
//! Also home to the process-monotonic microsecond clock everything in the
//! call path uses: `start_send_real_us`, `abstime_us` and timer deadlines are
//! all offsets on this clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use crate::errors::ErrorCode;
use crate::runtime;

/// Handle to one armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

/// Sentinel for "no timer armed".
pub const INVALID_TIMER_ID: TimerId = TimerId(0);

fn anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// Microseconds elapsed on the process-monotonic clock.
pub fn monotonic_us() -> i64 {
    anchor().elapsed().as_micros() as i64
}

pub(crate) fn instant_at_us(deadline_us: i64) -> Instant {
    anchor() + Duration::from_micros(deadline_us.max(0) as u64)
}

/// The process-wide single-shot timer scheduler.
pub struct TimerService {
    timers: Mutex<HashMap<u64, runtime::AbortHandle>>,
    next_id: AtomicU64,
}

/// The process-wide timer service.
pub fn timer_service() -> &'static TimerService {
    static SERVICE: OnceLock<TimerService> = OnceLock::new();
    SERVICE.get_or_init(|| TimerService {
        timers: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
    })
}

impl TimerService {
    fn timers(&self) -> MutexGuard<'_, HashMap<u64, runtime::AbortHandle>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm a single-shot timer at `deadline_us`. The callback runs once on a
    /// background task; a deadline in the past fires immediately.
    ///
    /// Fails when no runtime is reachable; callers treat that as fatal for
    /// the call being dispatched.
    pub fn add_at(
        &'static self,
        deadline_us: i64,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<TimerId, ErrorCode> {
        if !runtime::runtime_available() {
            return Err(ErrorCode::Internal);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Hold the table lock across spawn+insert: the timer task's first
        // step is to take this lock for self-removal, so it cannot observe
        // the table before its own entry lands.
        let mut table = self.timers();
        let handle = runtime::spawn_with_abort(async move {
            runtime::sleep_until(instant_at_us(deadline_us)).await;
            self.timers().remove(&id);
            callback();
        });
        table.insert(id, handle);
        Ok(TimerId(id))
    }

    /// Cancel a pending timer. Returns true if it had not fired yet.
    pub fn cancel(&self, id: TimerId) -> bool {
        if id == INVALID_TIMER_ID {
            return false;
        }
        match self.timers().remove(&id.0) {
            Some(handle) => handle.abort(),
            None => false,
        }
    }

    /// Number of timers currently armed. Exposed so callers (and tests) can
    /// verify nothing leaked after a call completed.
    pub fn pending_count(&self) -> usize {
        self.timers().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn fires_once_and_cleans_up() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let id = timer_service()
            .add_at(monotonic_us() + 10_000, move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // The fired timer removed its own table entry.
        assert!(!timer_service().cancel(id));
    }

    #[tokio::test]
    async fn cancel_prevents_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let id = timer_service()
            .add_at(monotonic_us() + 30_000, move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(timer_service().cancel(id));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // Cancelling twice reports false.
        assert!(!timer_service().cancel(id));
    }

    #[tokio::test]
    async fn past_deadline_fires_immediately() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        timer_service()
            .add_at(monotonic_us() - 1_000, move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
