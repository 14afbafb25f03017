use std::hash::Hash;
use std::time::Duration;

use rustc_hash::FxHashMap;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct RateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: FxHashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: FxHashMap::default() }
    }

    /// Delay before the next retry of `key`; counts as one more failure.
    pub fn when(&mut self, key: &K) -> Duration {
        let n = self.failures.entry(key.clone()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        2u32.checked_pow(exp)
            .and_then(|m| self.base.checked_mul(m))
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }

    pub fn forget(&mut self, key: &K) { self.failures.remove(key); }

    pub fn retries(&self, key: &K) -> u32 { self.failures.get(key).copied().unwrap_or(0) }
}

impl<K: Eq + Hash + Clone> Default for RateLimiter<K> {
    fn default() -> Self { Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let mut rl = RateLimiter::default();
        let k = "a".to_string();
        assert_eq!(rl.when(&k), Duration::from_millis(5));
        assert_eq!(rl.when(&k), Duration::from_millis(10));
        assert_eq!(rl.when(&k), Duration::from_millis(20));
        assert_eq!(rl.retries(&k), 3);
        for _ in 0..40 { rl.when(&k); }
        assert_eq!(rl.when(&k), DEFAULT_MAX_DELAY);
    }

    #[test]
    fn forget_resets_and_keys_are_independent() {
        let mut rl = RateLimiter::default();
        let (a, b) = ("a".to_string(), "b".to_string());
        rl.when(&a);
        rl.when(&a);
        assert_eq!(rl.when(&b), Duration::from_millis(5));
        rl.forget(&a);
        assert_eq!(rl.retries(&a), 0);
        assert_eq!(rl.when(&a), Duration::from_millis(5));
    }
}
