use std::{collections::HashMap, hash::Hash, time::Duration};

use parking_lot::Mutex;

/// Decides how long a failed item waits before it is queued again.
pub trait RateLimiter<T>: Send + Sync {
    /// Returns the delay for the next retry of `item` and records the failure.
    fn when(&self, item: &T) -> Duration;

    /// Clears the failure history of `item`.
    fn forget(&self, item: &T);

    /// The number of failures recorded for `item` since it was last forgotten.
    fn num_requeues(&self, item: &T) -> u32;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailure<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T> ItemExponentialFailure<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> Default for ItemExponentialFailure<T> {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl<T> RateLimiter<T> for ItemExponentialFailure<T>
where
    T: Clone + Eq + Hash + Send + Sync,
{
    fn when(&self, item: &T) -> Duration {
        let exp = {
            let mut failures = self.failures.lock();
            let count = failures.entry(item.clone()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };

        match 1u32.checked_shl(exp) {
            Some(factor) => self.base.saturating_mul(factor).min(self.max),
            None => self.max,
        }
    }

    fn forget(&self, item: &T) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}
