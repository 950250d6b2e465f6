//! VitalSync - Main Library
//!
//! VitalSync is an offline-first synchronization engine for personal
//! measurement records, featuring end-to-end encryption with rotating
//! keys, durable offline queuing, and a corruption circuit breaker that
//! keeps a damaged remote dataset from grinding the client down.
//!
//! # Overview
//!
//! This library provides the core functionality for VitalSync, including:
//! - Local-first reads and writes that never block on the network
//! - AES-256-GCM record encryption with key rotation and legacy-key fallback
//! - Recovery-phrase key backup and cross-device restore
//! - A persistent pending-operation queue with exponential backoff
//! - A two-way merge that is idempotent and safe to re-run
//! - Realtime change listening with debounced catch-up merges
//! - Diagnostics and repair tooling for drifted sync state
//!
//! # Module Structure
//!
//! - **`types`** - Measurement records, remote document shapes, and the
//!   persisted state keys
//! - **`store`** - Collaborator traits (local store, secret store, remote
//!   document store, network state, owner identity) plus in-memory
//!   implementations for tests
//! - **`crypto`** - Envelope format, encryption service, key rotation,
//!   and phrase-based key backup
//! - **`offline`** - Pending operation queue and backoff policy
//! - **`sync`** - The sync engine, corruption circuit breaker, and
//!   realtime listener
//! - **`repair`** - Operator diagnostics and repair actions
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vitalsync::{
//!     EncryptionService, NewMeasurement, RealtimeListener, SyncConfig, SyncEngine,
//! };
//! use vitalsync::store::memory::{
//!     MemoryLocalStore, MemoryNetwork, MemoryRemoteStore, MemorySecretStore, StaticOwner,
//! };
//!
//! # async fn example() -> vitalsync::Result<()> {
//! let config = SyncConfig::default();
//! let secrets = Arc::new(MemorySecretStore::new());
//! let crypto = Arc::new(EncryptionService::new(secrets, config.clone()));
//!
//! let engine = Arc::new(
//!     SyncEngine::new(
//!         config,
//!         Arc::new(MemoryLocalStore::new()),
//!         Arc::new(MemoryRemoteStore::new()),
//!         Arc::new(MemoryNetwork::new(true)),
//!         Arc::new(StaticOwner::signed_in("owner-1")),
//!         crypto,
//!     )
//!     .await?,
//! );
//!
//! let record = engine
//!     .add_measurement(NewMeasurement {
//!         value: 112.0,
//!         kind: "fasting".to_string(),
//!         timestamp: 1_700_000_000_000,
//!         notes: None,
//!     })
//!     .await?;
//! println!("stored {}", record.id);
//!
//! let listener = RealtimeListener::new(Arc::clone(&engine));
//! listener.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Thread Safety
//!
//! The engine is `Send + Sync` and designed to be shared behind an
//! `Arc`. Sync cycles are single-flight; the merge is commutative and
//! idempotent, so concurrent triggers from the listener, connectivity
//! callbacks, and manual calls are harmless.
//!
//! # Error Handling
//!
//! All fallible operations return [`Result`] with the [`SyncError`]
//! taxonomy. Remote failures during mutations are absorbed into the
//! pending queue instead of surfacing; local store failures always
//! surface.

/// Engine configuration
pub mod config;

/// Envelope format, encryption service, and key management
pub mod crypto;

/// Error taxonomy
pub mod error;

/// Durable offline queuing
pub mod offline;

/// Diagnostics and repair tooling
pub mod repair;

/// Collaborator traits and in-memory implementations
pub mod store;

/// Sync engine, circuit breaker, and realtime listener
pub mod sync;

/// Core data types
pub mod types;

pub use config::SyncConfig;
pub use crypto::{DecryptOutcome, EncryptionService};
pub use error::{Result, SyncError};
pub use offline::{OperationKind, PendingOperation, PendingOperationQueue};
pub use repair::{DiagnosticsReport, DocumentHealth, SyncDoctor};
pub use sync::breaker::{BreakerSnapshot, BreakerState, CorruptionBreaker};
pub use sync::listener::RealtimeListener;
pub use sync::{SyncEngine, SyncOutcome, RECORDS_COLLECTION};
pub use types::{Measurement, NewMeasurement, RemoteChange, RemoteDocument, SyncMetadata};
