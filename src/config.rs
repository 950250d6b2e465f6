//! # Sync Configuration
//!
//! Tunables for the sync engine, circuit breaker, pending queue, and
//! realtime listener. Defaults match production behavior; individual
//! knobs can be overridden through environment variables for debugging.

use std::time::Duration;

/// Default minimum interval between `sync_with_cloud` cycles
const DEFAULT_SYNC_DEBOUNCE: Duration = Duration::from_secs(5);
/// Default debounce window for realtime change notifications
const DEFAULT_LISTENER_DEBOUNCE: Duration = Duration::from_millis(2500);

/// Configuration for the sync engine and its components
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Minimum interval between consecutive sync cycles
    pub sync_debounce: Duration,
    /// Debounce window applied to realtime change notifications
    pub listener_debounce: Duration,
    /// Maximum pending operations retained in the offline queue
    pub queue_capacity: usize,
    /// Base delay for pending-operation retry backoff
    pub backoff_base: Duration,
    /// Upper bound on retry backoff delay
    pub backoff_max: Duration,
    /// Failures before the circuit breaker opens
    pub breaker_failure_threshold: u32,
    /// Consecutive half-open successes required to close the breaker
    pub breaker_success_threshold: u32,
    /// Cooldown before an open breaker probes recovery
    pub breaker_reset_timeout: Duration,
    /// Maximum superseded keys retained for legacy decryption
    pub max_legacy_keys: usize,
    /// PBKDF2 iterations for phrase-derived key wrapping
    pub phrase_kdf_iterations: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_debounce: env_duration_secs("VITALSYNC_SYNC_DEBOUNCE_SECS", DEFAULT_SYNC_DEBOUNCE),
            listener_debounce: DEFAULT_LISTENER_DEBOUNCE,
            queue_capacity: 500,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(600),
            breaker_failure_threshold: 5,
            breaker_success_threshold: 2,
            breaker_reset_timeout: env_duration_secs(
                "VITALSYNC_BREAKER_RESET_SECS",
                Duration::from_secs(60),
            ),
            max_legacy_keys: 5,
            phrase_kdf_iterations: 150_000,
        }
    }
}

impl SyncConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration suited to unit tests: short timers, few iterations
    pub fn for_tests() -> Self {
        Self {
            sync_debounce: Duration::ZERO,
            listener_debounce: Duration::from_millis(20),
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_millis(400),
            breaker_reset_timeout: Duration::from_millis(100),
            phrase_kdf_iterations: 1_000,
            ..Self::default()
        }
    }
}

fn env_duration_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = SyncConfig::new();
        assert_eq!(config.queue_capacity, 500);
        assert_eq!(config.breaker_failure_threshold, 5);
        assert_eq!(config.breaker_success_threshold, 2);
        assert_eq!(config.max_legacy_keys, 5);
        assert_eq!(config.backoff_base, Duration::from_secs(5));
        assert_eq!(config.backoff_max, Duration::from_secs(600));
    }

    #[test]
    fn test_test_profile_is_fast() {
        let config = SyncConfig::for_tests();
        assert!(config.backoff_max < Duration::from_secs(1));
        assert!(config.phrase_kdf_iterations < 10_000);
    }
}
