//! # Corruption Circuit Breaker
//!
//! A persisted failure-counting state machine that suspends remote
//! operations after repeated corruption/failure signals and probes for
//! recovery after a cooldown.
//!
//! The breaker exists to stop a pathological loop: a corrupted remote
//! document causes a decrypt failure, which triggers a repair write,
//! which itself fails or re-corrupts, which triggers another repair on
//! the next sync. Opening the breaker caps total repair attempts within
//! a time window.
//!
//! ## Transitions
//!
//! - **Closed** (initial): failures accumulate; at `failure_threshold`
//!   the breaker opens. Successes decay the failure count by 0.5 rather
//!   than resetting it, avoiding oscillation under low-grade flakiness.
//! - **Open**: operations short-circuit; further failures are ignored
//!   (not double-counted). After `reset_timeout` the next check moves to
//!   half-open.
//! - **HalfOpen**: a trial state seeded at half the failure threshold;
//!   `success_threshold` consecutive successes close the breaker, any
//!   failure reopens it.
//!
//! State is persisted after every transition. On load, an open breaker
//! whose deadline already passed self-transitions to half-open rather
//! than waiting for a timer that never fired.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::store::LocalRecordStore;
use crate::types::{now_ms, state_keys};

/// Maximum retained error entries
const MAX_RECENT_ERRORS: usize = 10;
/// Maximum age of a retained error entry
const MAX_ERROR_AGE_MS: i64 = 24 * 60 * 60 * 1000;

/// Breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    /// Operations proceed
    Closed,
    /// Operations short-circuit
    Open,
    /// Trial state probing recovery
    HalfOpen,
}

/// One recorded failure, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerError {
    /// What failed
    pub message: String,
    /// When it failed (ms)
    pub at: i64,
}

/// Persisted breaker state
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedState {
    state: BreakerState,
    failure_count: f64,
    success_count: u32,
    last_failure_at: Option<i64>,
    /// When an open breaker may probe recovery (ms)
    open_until: Option<i64>,
    recent_errors: Vec<BreakerError>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0.0,
            success_count: 0,
            last_failure_at: None,
            open_until: None,
            recent_errors: Vec::new(),
        }
    }
}

/// Read-only snapshot for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Current position
    pub state: BreakerState,
    /// Accumulated (decayed) failure count
    pub failure_count: f64,
    /// Consecutive successes in the current state
    pub success_count: u32,
    /// Most recent failure time (ms)
    pub last_failure_at: Option<i64>,
    /// Bounded recent failure log
    pub recent_errors: Vec<BreakerError>,
}

/// Persisted corruption circuit breaker, one per sync scope
pub struct CorruptionBreaker {
    store: Arc<dyn LocalRecordStore>,
    scope: String,
    failure_threshold: f64,
    success_threshold: u32,
    reset_timeout: Duration,
    state: Mutex<PersistedState>,
}

impl CorruptionBreaker {
    /// Load the breaker for `scope` from the local store. An expired open
    /// deadline transitions to half-open immediately.
    pub async fn load(
        store: Arc<dyn LocalRecordStore>,
        scope: impl Into<String>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let scope = scope.into();
        let key = Self::storage_key(&scope);
        let mut state = match store.get(&key).await? {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(scope = %scope, "discarding unreadable breaker state: {}", e);
                PersistedState::default()
            }),
            None => PersistedState::default(),
        };

        let breaker = Self {
            store,
            scope,
            failure_threshold: f64::from(config.breaker_failure_threshold),
            success_threshold: config.breaker_success_threshold,
            reset_timeout: config.breaker_reset_timeout,
            state: Mutex::new(PersistedState::default()),
        };

        // The reset timer does not survive a restart; honor a deadline
        // that passed while the process was down.
        if state.state == BreakerState::Open && breaker.deadline_passed(&state, now_ms()) {
            info!(scope = %breaker.scope, "open deadline passed during downtime, probing recovery");
            breaker.enter_half_open(&mut state);
            breaker.persist(&state).await?;
        }

        *breaker.state.lock().await = state;
        Ok(breaker)
    }

    /// Whether operations guarded by this breaker may proceed. An open
    /// breaker whose cooldown has elapsed transitions to half-open here.
    pub async fn can_execute(&self) -> bool {
        let mut state = self.state.lock().await;
        match state.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if self.deadline_passed(&state, now_ms()) {
                    info!(scope = %self.scope, "breaker cooldown elapsed, entering half-open");
                    self.enter_half_open(&mut state);
                    if let Err(e) = self.persist(&state).await {
                        warn!(scope = %self.scope, "failed to persist breaker state: {}", e);
                    }
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Short-circuit helper: `CircuitOpen` unless execution is allowed
    pub async fn guard(&self) -> Result<()> {
        if self.can_execute().await {
            Ok(())
        } else {
            Err(SyncError::circuit_open(self.scope.clone()))
        }
    }

    /// Record a failure. Returns `true` when this failure transitioned
    /// the breaker to open (callers abort their cycle on `true`).
    pub async fn record_failure(&self, reason: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = now_ms();

        let just_opened = match state.state {
            // Already open: do not double-count.
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                warn!(scope = %self.scope, reason, "half-open trial failed, reopening breaker");
                self.open(&mut state, now, reason);
                true
            }
            BreakerState::Closed => {
                state.failure_count += 1.0;
                state.success_count = 0;
                state.last_failure_at = Some(now);
                push_error(&mut state.recent_errors, reason, now);
                if state.failure_count >= self.failure_threshold {
                    warn!(
                        scope = %self.scope,
                        failures = state.failure_count,
                        reason,
                        "failure threshold reached, opening breaker"
                    );
                    self.open(&mut state, now, reason);
                    true
                } else {
                    debug!(
                        scope = %self.scope,
                        failures = state.failure_count,
                        threshold = self.failure_threshold,
                        reason,
                        "breaker failure recorded"
                    );
                    false
                }
            }
        };

        self.persist(&state).await?;
        Ok(just_opened)
    }

    /// Record a success. In half-open, enough consecutive successes close
    /// the breaker; in closed, the failure count decays by 0.5.
    pub async fn record_success(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.state {
            BreakerState::Open => return Ok(()),
            BreakerState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.success_threshold {
                    info!(scope = %self.scope, "recovery confirmed, closing breaker");
                    *state = PersistedState::default();
                }
            }
            BreakerState::Closed => {
                state.success_count += 1;
                state.failure_count = (state.failure_count - 0.5).max(0.0);
            }
        }
        self.persist(&state).await
    }

    /// Force the breaker closed with zeroed counters
    pub async fn reset(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        info!(scope = %self.scope, "breaker manually reset");
        *state = PersistedState::default();
        self.persist(&state).await
    }

    /// Snapshot for diagnostics
    pub async fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock().await;
        BreakerSnapshot {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            last_failure_at: state.last_failure_at,
            recent_errors: state.recent_errors.clone(),
        }
    }

    /// Scope name this breaker guards
    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn storage_key(scope: &str) -> String {
        format!("{}:{}", state_keys::CIRCUIT_BREAKER, scope)
    }

    fn deadline_passed(&self, state: &PersistedState, now: i64) -> bool {
        state.open_until.is_some_and(|until| now >= until)
    }

    fn open(&self, state: &mut PersistedState, now: i64, reason: &str) {
        state.state = BreakerState::Open;
        state.last_failure_at = Some(now);
        state.open_until = Some(now + self.reset_timeout.as_millis() as i64);
        state.success_count = 0;
        push_error(&mut state.recent_errors, reason, now);
    }

    fn enter_half_open(&self, state: &mut PersistedState) {
        state.state = BreakerState::HalfOpen;
        state.failure_count = self.failure_threshold / 2.0;
        state.success_count = 0;
        state.open_until = None;
    }

    async fn persist(&self, state: &PersistedState) -> Result<()> {
        let bytes = serde_json::to_vec(state)?;
        self.store.set(&Self::storage_key(&self.scope), &bytes).await
    }
}

fn push_error(errors: &mut Vec<BreakerError>, message: &str, now: i64) {
    errors.push(BreakerError {
        message: message.to_string(),
        at: now,
    });
    errors.retain(|e| now - e.at <= MAX_ERROR_AGE_MS);
    let excess = errors.len().saturating_sub(MAX_RECENT_ERRORS);
    if excess > 0 {
        errors.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryLocalStore;
    use assert_matches::assert_matches;

    async fn breaker_with(config: &SyncConfig) -> CorruptionBreaker {
        CorruptionBreaker::load(Arc::new(MemoryLocalStore::new()), "sync", config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_opens_at_threshold() {
        let config = SyncConfig::for_tests();
        let breaker = breaker_with(&config).await;

        for i in 0..4 {
            let just_opened = breaker.record_failure("decrypt failed").await.unwrap();
            assert!(!just_opened, "should not open at failure {}", i + 1);
            assert!(breaker.can_execute().await);
        }
        let just_opened = breaker.record_failure("decrypt failed").await.unwrap();
        assert!(just_opened);
        assert!(!breaker.can_execute().await);
        assert_matches!(breaker.guard().await, Err(SyncError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_open_failures_not_double_counted() {
        let config = SyncConfig::for_tests();
        let breaker = breaker_with(&config).await;
        for _ in 0..5 {
            breaker.record_failure("x").await.unwrap();
        }
        let just_opened = breaker.record_failure("x").await.unwrap();
        assert!(!just_opened);
        assert_eq!(breaker.snapshot().await.failure_count, 5.0);
    }

    #[tokio::test]
    async fn test_success_decays_rather_than_resets() {
        let config = SyncConfig::for_tests();
        let breaker = breaker_with(&config).await;

        breaker.record_failure("x").await.unwrap();
        breaker.record_failure("x").await.unwrap();
        breaker.record_success().await.unwrap();

        assert_eq!(breaker.snapshot().await.failure_count, 1.5);
    }

    #[tokio::test]
    async fn test_cooldown_then_half_open_recovery() {
        let config = SyncConfig::for_tests(); // 100ms reset timeout
        let breaker = breaker_with(&config).await;

        for _ in 0..5 {
            breaker.record_failure("x").await.unwrap();
        }
        assert!(!breaker.can_execute().await);

        tokio::time::sleep(config.breaker_reset_timeout + Duration::from_millis(20)).await;
        assert!(breaker.can_execute().await);
        assert_eq!(breaker.snapshot().await.state, BreakerState::HalfOpen);
        // Seeded at half the threshold.
        assert_eq!(breaker.snapshot().await.failure_count, 2.5);

        breaker.record_success().await.unwrap();
        assert_eq!(breaker.snapshot().await.state, BreakerState::HalfOpen);
        breaker.record_success().await.unwrap();
        assert_eq!(breaker.snapshot().await.state, BreakerState::Closed);
        assert_eq!(breaker.snapshot().await.failure_count, 0.0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let config = SyncConfig::for_tests();
        let breaker = breaker_with(&config).await;

        for _ in 0..5 {
            breaker.record_failure("x").await.unwrap();
        }
        tokio::time::sleep(config.breaker_reset_timeout + Duration::from_millis(20)).await;
        assert!(breaker.can_execute().await);

        let just_opened = breaker.record_failure("still broken").await.unwrap();
        assert!(just_opened);
        assert!(!breaker.can_execute().await);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let store: Arc<dyn LocalRecordStore> = Arc::new(MemoryLocalStore::new());
        let config = SyncConfig {
            breaker_reset_timeout: Duration::from_secs(3600),
            ..SyncConfig::for_tests()
        };

        {
            let breaker = CorruptionBreaker::load(Arc::clone(&store), "sync", &config)
                .await
                .unwrap();
            for _ in 0..5 {
                breaker.record_failure("x").await.unwrap();
            }
        }

        let reloaded = CorruptionBreaker::load(store, "sync", &config).await.unwrap();
        assert!(!reloaded.can_execute().await);
        assert_eq!(reloaded.snapshot().await.state, BreakerState::Open);
    }

    #[tokio::test]
    async fn test_expired_deadline_probes_on_load() {
        let store: Arc<dyn LocalRecordStore> = Arc::new(MemoryLocalStore::new());
        let config = SyncConfig::for_tests(); // 100ms reset timeout

        {
            let breaker = CorruptionBreaker::load(Arc::clone(&store), "sync", &config)
                .await
                .unwrap();
            for _ in 0..5 {
                breaker.record_failure("x").await.unwrap();
            }
        }

        tokio::time::sleep(config.breaker_reset_timeout + Duration::from_millis(20)).await;

        // Deadline passed while "the process was down".
        let reloaded = CorruptionBreaker::load(store, "sync", &config).await.unwrap();
        assert_eq!(reloaded.snapshot().await.state, BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn test_manual_reset() {
        let config = SyncConfig::for_tests();
        let breaker = breaker_with(&config).await;
        for _ in 0..5 {
            breaker.record_failure("x").await.unwrap();
        }
        breaker.reset().await.unwrap();

        let snapshot = breaker.snapshot().await;
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.failure_count, 0.0);
        assert!(snapshot.recent_errors.is_empty());
        assert!(breaker.can_execute().await);
    }

    #[tokio::test]
    async fn test_recent_errors_bounded() {
        let config = SyncConfig {
            breaker_failure_threshold: 100,
            ..SyncConfig::for_tests()
        };
        let breaker = breaker_with(&config).await;
        for i in 0..25 {
            breaker.record_failure(&format!("error {}", i)).await.unwrap();
        }
        let errors = breaker.snapshot().await.recent_errors;
        assert_eq!(errors.len(), 10);
        assert_eq!(errors.last().unwrap().message, "error 24");
    }
}
