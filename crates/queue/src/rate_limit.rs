//! Per-item retry delay policies.

use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;

/// Decides how long a failed item waits before it is redelivered.
pub trait RateLimiter<T>: Send + Sync {
    /// Delay for the next retry of `item`; records one more failure.
    fn when(&self, item: &T) -> Duration;
    /// Reset the failure history of `item`.
    fn forget(&self, item: &T);
    /// Failures recorded since the last `forget`.
    fn num_requeues(&self, item: &T) -> u32;
}

/// Floor for the base delay; a zero base would redeliver failing items in a busy loop.
pub const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// `base * 2^failures`, capped at `max`.
pub struct ExponentialBackoff<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<T, u32>>,
}

impl<T> ExponentialBackoff<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(MIN_BACKOFF);
        Self { base, max: max.max(base), failures: Mutex::new(FxHashMap::default()) }
    }
}

/// Delay after `failures` previous failures. Saturates at `max` instead of overflowing.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    2u32.checked_pow(failures)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |d| d.min(max))
}

impl<T: Eq + Hash + Clone + Send> RateLimiter<T> for ExponentialBackoff<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(item.clone()).or_insert(0);
        let delay = backoff_delay(self.base, self.max, *count);
        *count = count.saturating_add(1);
        delay
    }

    fn forget(&self, item: &T) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(item)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_capped() {
        let rl = ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(60));
        let seq: Vec<u64> = (0..6).map(|_| rl.when(&"k").as_secs()).collect();
        assert_eq!(seq, vec![5, 10, 20, 40, 60, 60]);
        assert_eq!(rl.num_requeues(&"k"), 6);
    }

    #[test]
    fn forget_resets_to_base() {
        let rl = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1));
        rl.when(&1u32);
        rl.when(&1u32);
        assert_eq!(rl.when(&1u32), Duration::from_millis(40));
        rl.forget(&1u32);
        assert_eq!(rl.num_requeues(&1u32), 0);
        assert_eq!(rl.when(&1u32), Duration::from_millis(10));
    }

    #[test]
    fn items_back_off_independently() {
        let rl = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1));
        rl.when(&"a");
        rl.when(&"a");
        assert_eq!(rl.when(&"b"), Duration::from_millis(10));
        assert_eq!(rl.num_requeues(&"a"), 2);
    }

    #[test]
    fn huge_failure_counts_saturate_at_max() {
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(Duration::from_secs(5), max, 31), max);
        assert_eq!(backoff_delay(Duration::from_secs(5), max, u32::MAX), max);
    }

    #[test]
    fn delays_never_decrease() {
        let rl = ExponentialBackoff::new(Duration::from_millis(3), Duration::from_millis(500));
        let mut prev = Duration::ZERO;
        for _ in 0..40 {
            let d = rl.when(&"k");
            assert!(d >= prev, "{:?} < {:?}", d, prev);
            assert!(d <= Duration::from_millis(500));
            prev = d;
        }
    }

    #[test]
    fn zero_base_still_waits() {
        let rl = ExponentialBackoff::new(Duration::ZERO, Duration::from_millis(100));
        assert_eq!(rl.when(&"k"), MIN_BACKOFF);
        assert_eq!(rl.when(&"k"), MIN_BACKOFF * 2);
    }
}
