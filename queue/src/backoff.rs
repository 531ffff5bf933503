//! Per-key exponential backoff.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;

/// Delay before retry number `failures` (0-based): `base * 2^failures`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Tracks consecutive failures per key and hands out growing delays.
#[derive(Debug)]
pub struct ExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Clone + Eq + Hash> ExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying.
    pub fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.clone()).or_insert(0);
        let delay = backoff_delay(self.base, self.max, *count);
        *count = count.saturating_add(1);
        delay
    }

    /// Number of failures recorded for `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }

    /// Reset `key` after success or after giving up on it.
    pub fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    /// Number of keys currently backing off.
    pub fn len(&self) -> usize {
        self.failures.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_doubles() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(300);
        assert_eq!(backoff_delay(base, max, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, max, 4), Duration::from_secs(16));
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(300);
        assert_eq!(backoff_delay(base, max, 9), Duration::from_secs(300));
        assert_eq!(backoff_delay(base, max, 64), Duration::from_secs(300));
    }

    #[test]
    fn test_when_grows_per_key() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1));
        assert_eq!(backoff.when(&"a"), Duration::from_millis(10));
        assert_eq!(backoff.when(&"a"), Duration::from_millis(20));
        assert_eq!(backoff.when(&"b"), Duration::from_millis(10));
        assert_eq!(backoff.num_requeues(&"a"), 2);
        assert_eq!(backoff.len(), 2);
    }

    #[test]
    fn test_forget_resets() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1));
        backoff.when(&"a");
        backoff.when(&"a");
        backoff.forget(&"a");
        assert_eq!(backoff.num_requeues(&"a"), 0);
        assert_eq!(backoff.when(&"a"), Duration::from_millis(10));
    }
}
