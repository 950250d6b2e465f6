//! # Sync Error Types
//!
//! Defines the error taxonomy for the sync engine. Every fallible path in
//! the crate funnels into [`SyncError`].
//!
//! # Error Categories
//!
//! - `Decryption` - every available key was exhausted against an envelope
//! - `CircuitOpen` - sync is suspended by the corruption circuit breaker
//! - `NotAuthenticated` - no owner identity; remote operations no-op
//! - `NetworkUnavailable` - operation deferred to the pending queue
//! - `QueueOverflow` - the pending queue dropped its oldest entries
//! - `InvalidPhrase` - recovery phrase failed to unwrap a backup key
//! - `LocalStore` / `RemoteStore` - collaborator I/O failures
//! - `KeyMissing` - no current key, no legacy keys, no phrase backup
//!
//! # Propagation Policy
//!
//! Local-store failures are always surfaced: they indicate a real I/O
//! problem the caller must know about. Remote failures on best-effort
//! paths (corruption marking, metadata updates) are swallowed and logged
//! by the caller, never surfaced.
//!
//! # Thread Safety
//!
//! All error types are `Send + Sync` and can be safely shared across task
//! boundaries.
use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors produced by the sync engine and its components
#[derive(Debug, Error, Clone)]
pub enum SyncError {
    /// No key (current or legacy) could decrypt an envelope
    #[error("Decryption failed: {message}")]
    Decryption {
        /// Human-readable error message
        message: String,
    },

    /// The circuit breaker is open and remote operations are suspended
    #[error("Sync paused by circuit breaker '{scope}', retrying later")]
    CircuitOpen {
        /// The breaker scope that rejected the operation
        scope: String,
    },

    /// No authenticated owner identity is available
    #[error("Not authenticated: no owner identity")]
    NotAuthenticated,

    /// No network connectivity; the operation was deferred
    #[error("Network unavailable, operation queued for retry")]
    NetworkUnavailable,

    /// The pending operation queue exceeded capacity and dropped entries
    #[error("Pending queue overflow: dropped {dropped} oldest operation(s)")]
    QueueOverflow {
        /// Number of operations dropped from the head of the queue
        dropped: usize,
    },

    /// A recovery phrase failed to unwrap the backed-up key
    #[error("Invalid recovery phrase: {message}")]
    InvalidPhrase {
        /// Human-readable error message
        message: String,
    },

    /// Local record store I/O failure
    #[error("Local store error: {message}")]
    LocalStore {
        /// Human-readable error message
        message: String,
    },

    /// Remote document store failure
    #[error("Remote store error: {message}")]
    RemoteStore {
        /// Human-readable error message
        message: String,
    },

    /// JSON serialization or deserialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Human-readable error message
        message: String,
    },

    /// No usable key material exists; previously-encrypted remote data is
    /// at risk until a key is restored from a phrase backup
    #[error("Key material missing: {message}")]
    KeyMissing {
        /// Human-readable error message
        message: String,
    },
}

impl SyncError {
    /// Create a new decryption error
    pub fn decryption(message: impl Into<String>) -> Self {
        Self::Decryption {
            message: message.into(),
        }
    }

    /// Create a new circuit-open error for a breaker scope
    pub fn circuit_open(scope: impl Into<String>) -> Self {
        Self::CircuitOpen {
            scope: scope.into(),
        }
    }

    /// Create a new invalid-phrase error
    pub fn invalid_phrase(message: impl Into<String>) -> Self {
        Self::InvalidPhrase {
            message: message.into(),
        }
    }

    /// Create a new local-store error
    pub fn local_store(message: impl Into<String>) -> Self {
        Self::LocalStore {
            message: message.into(),
        }
    }

    /// Create a new remote-store error
    pub fn remote_store(message: impl Into<String>) -> Self {
        Self::RemoteStore {
            message: message.into(),
        }
    }

    /// Create a new serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a new key-missing error
    pub fn key_missing(message: impl Into<String>) -> Self {
        Self::KeyMissing {
            message: message.into(),
        }
    }

    /// Whether this error indicates the remote write should be queued
    /// for replay rather than surfaced to the caller
    pub fn is_deferrable(&self) -> bool {
        matches!(
            self,
            Self::NetworkUnavailable | Self::RemoteStore { .. } | Self::CircuitOpen { .. }
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(format!("JSON error: {}", err))
    }
}
