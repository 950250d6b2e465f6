//! # Offline Support
//!
//! Durable queuing of mutations that could not reach the remote store,
//! plus the shared backoff policy governing their replay.

pub mod backoff;
pub mod queue;

pub use backoff::BackoffPolicy;
pub use queue::{OperationKind, PendingOperation, PendingOperationQueue};
