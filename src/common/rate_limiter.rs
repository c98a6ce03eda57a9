//! Per-account request limiter using a token bucket
//!
//! Bounds concurrent exchange requests for one account. The bucket size can
//! be raised while a trade is being executed and restored afterwards.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

/// Token-bucket limiter for exchange requests.
///
/// Permits refill once per interval up to the configured rate. `acquire`
/// consumes a permit and suspends when the bucket is empty.
#[derive(Debug)]
pub struct RequestLimiter {
    permits: Arc<Semaphore>,
    rate: AtomicUsize,
    last_refill: Arc<Mutex<Instant>>,
    refill_interval: Duration,
}

impl RequestLimiter {
    pub fn new(rate: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(rate)),
            rate: AtomicUsize::new(rate),
            last_refill: Arc::new(Mutex::new(Instant::now())),
            refill_interval: Duration::from_secs(1),
        }
    }

    /// Current bucket size (requests per refill interval).
    pub fn rate(&self) -> usize {
        self.rate.load(Ordering::Relaxed)
    }

    /// Change the bucket size. Used when execution mode toggles: the next
    /// refill fills to the new rate. Shrinking does not revoke permits
    /// already handed out.
    pub fn set_rate(&self, rate: usize) {
        let previous = self.rate.swap(rate, Ordering::Relaxed);
        if rate > previous {
            self.permits.add_permits(rate - previous);
        }
    }

    /// Acquire a permit to make a request, refilling the bucket first if the
    /// refill interval has elapsed. The permit is consumed.
    pub async fn acquire(&self) {
        self.try_refill().await;
        let permit = self
            .permits
            .acquire()
            .await
            .expect("request limiter semaphore closed");
        permit.forget();
    }

    /// Number of permits currently available.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn try_refill(&self) {
        let mut last_refill = self.last_refill.lock().await;
        if last_refill.elapsed() >= self.refill_interval {
            let rate = self.rate.load(Ordering::Relaxed);
            let current = self.permits.available_permits();
            let to_add = rate.saturating_sub(current);
            if to_add > 0 {
                self.permits.add_permits(to_add);
            }
            *last_refill = Instant::now();
        }
    }
}
