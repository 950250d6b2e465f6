//! # Backoff Policy
//!
//! One exponential-backoff computation shared by every retry path in the
//! crate (the pending operation queue and remote-fetch corruption
//! handling), instead of ad hoc attempt counters at each call site.

use std::time::Duration;

use crate::config::SyncConfig;

/// Exponential backoff with an upper bound, no jitter
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound on any delay
    pub max: Duration,
}

impl BackoffPolicy {
    /// Build from the engine configuration
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base: config.backoff_base,
            max: config.backoff_max,
        }
    }

    /// Delay before retrying after `attempts` failures (attempts >= 1):
    /// `min(base * 2^(attempts-1), max)`
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(63);
        let multiplier = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let delay = self
            .base
            .as_millis()
            .saturating_mul(multiplier as u128)
            .min(self.max.as_millis());
        Duration::from_millis(delay as u64)
    }

    /// Absolute ms timestamp of the next allowed attempt
    pub fn next_attempt_at(&self, now_ms: i64, attempts: u32) -> i64 {
        now_ms.saturating_add(self.delay_for(attempts).as_millis() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(5),
            max: Duration::from_secs(600),
        }
    }

    #[test]
    fn test_doubling_until_cap() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_secs(5));
        assert_eq!(p.delay_for(2), Duration::from_secs(10));
        assert_eq!(p.delay_for(3), Duration::from_secs(20));
        assert_eq!(p.delay_for(8), Duration::from_secs(600)); // 640 capped
        assert_eq!(p.delay_for(40), Duration::from_secs(600));
    }

    #[test]
    fn test_extreme_attempts_do_not_overflow() {
        let p = policy();
        assert_eq!(p.delay_for(u32::MAX), Duration::from_secs(600));
        let at = p.next_attempt_at(i64::MAX - 1, 3);
        assert_eq!(at, i64::MAX);
    }

    proptest! {
        #[test]
        fn prop_delay_monotone_and_bounded(a in 1u32..100, b in 1u32..100) {
            let p = policy();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(p.delay_for(lo) <= p.delay_for(hi));
            prop_assert!(p.delay_for(hi) <= p.max);
        }
    }
}
