//! # Pending Operation Queue
//!
//! Durable FIFO of mutations that could not be applied remotely yet.
//! Every mutation is followed by a write-through to the local store, so a
//! process restart resumes exactly where it left off.
//!
//! ## Behavior
//!
//! - Operations enter with `attempts = 0` and are immediately eligible.
//! - Failed replays back off exponentially via the shared
//!   [`BackoffPolicy`](crate::offline::backoff::BackoffPolicy).
//! - The queue is bounded; on overflow the oldest entries are dropped.
//!   The loss is logged and reported through the enqueue return value,
//!   never as an error.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::offline::backoff::BackoffPolicy;
use crate::store::LocalRecordStore;
use crate::types::{now_ms, state_keys, Measurement};

/// The mutation a pending operation will replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Upload a record that was added while offline
    Add(Measurement),
    /// Delete the remote mirror of a record removed while offline
    Delete,
}

impl OperationKind {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Add(_) => "add",
            Self::Delete => "delete",
        }
    }
}

/// A durable record of a deferred mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Unique id of this queue entry
    pub op_id: Uuid,
    /// The mutation to replay
    pub kind: OperationKind,
    /// Record the mutation applies to
    pub record_id: Uuid,
    /// When the operation was enqueued (ms)
    pub enqueued_at: i64,
    /// Replay attempts so far
    pub attempts: u32,
    /// Earliest time the next attempt may run (ms)
    pub next_attempt_at: i64,
}

impl PendingOperation {
    /// Create an immediately-eligible operation
    pub fn new(kind: OperationKind, record_id: Uuid) -> Self {
        let now = now_ms();
        Self {
            op_id: Uuid::new_v4(),
            kind,
            record_id,
            enqueued_at: now,
            attempts: 0,
            next_attempt_at: now,
        }
    }
}

/// Persisted, ordered queue of pending operations
pub struct PendingOperationQueue {
    store: Arc<dyn LocalRecordStore>,
    capacity: usize,
    backoff: BackoffPolicy,
    operations: RwLock<VecDeque<PendingOperation>>,
}

impl PendingOperationQueue {
    /// Load the queue from the local store, starting empty if no state
    /// was persisted
    pub async fn load(store: Arc<dyn LocalRecordStore>, config: &SyncConfig) -> Result<Self> {
        let operations = match store.get(state_keys::PENDING_OPERATIONS).await? {
            Some(bytes) => serde_json::from_slice::<VecDeque<PendingOperation>>(&bytes)
                .unwrap_or_else(|e| {
                    warn!("discarding unreadable pending queue: {}", e);
                    VecDeque::new()
                }),
            None => VecDeque::new(),
        };
        if !operations.is_empty() {
            debug!(pending = operations.len(), "restored pending queue");
        }
        Ok(Self {
            store,
            capacity: config.queue_capacity,
            backoff: BackoffPolicy::from_config(config),
            operations: RwLock::new(operations),
        })
    }

    /// Append an operation. If the queue exceeds capacity the oldest
    /// entries are dropped and logged. Returns how many were dropped.
    pub async fn enqueue(&self, operation: PendingOperation) -> Result<usize> {
        let (snapshot, dropped) = {
            let mut operations = self.operations.write().await;
            operations.push_back(operation);
            let overflow = operations.len().saturating_sub(self.capacity);
            if overflow > 0 {
                operations.drain(..overflow);
                warn!(
                    capacity = self.capacity,
                    "{}",
                    SyncError::QueueOverflow { dropped: overflow }
                );
            }
            (operations.clone(), overflow)
        };
        self.persist(&snapshot).await?;
        Ok(dropped)
    }

    /// Operations eligible to run at `now`, in original FIFO order
    pub async fn ready_operations(&self, now: i64) -> Vec<PendingOperation> {
        self.operations
            .read()
            .await
            .iter()
            .filter(|op| op.next_attempt_at <= now)
            .cloned()
            .collect()
    }

    /// Remove a successfully replayed operation
    pub async fn complete(&self, op_id: &Uuid) -> Result<()> {
        let snapshot = {
            let mut operations = self.operations.write().await;
            operations.retain(|op| op.op_id != *op_id);
            operations.clone()
        };
        self.persist(&snapshot).await
    }

    /// Record a failed replay: bump the attempt counter and push the next
    /// eligibility time out by the backoff policy
    pub async fn record_failure(&self, op_id: &Uuid, now: i64) -> Result<()> {
        let snapshot = {
            let mut operations = self.operations.write().await;
            if let Some(op) = operations.iter_mut().find(|op| op.op_id == *op_id) {
                op.attempts += 1;
                op.next_attempt_at = self.backoff.next_attempt_at(now, op.attempts);
                debug!(
                    op = op.kind.name(),
                    record_id = %op.record_id,
                    attempts = op.attempts,
                    next_attempt_at = op.next_attempt_at,
                    "pending operation failed, backing off"
                );
            }
            operations.clone()
        };
        self.persist(&snapshot).await
    }

    /// Record ids that have an operation queued
    pub async fn pending_record_ids(&self) -> std::collections::HashSet<Uuid> {
        self.operations
            .read()
            .await
            .iter()
            .map(|op| op.record_id)
            .collect()
    }

    /// Number of queued operations
    pub async fn len(&self) -> usize {
        self.operations.read().await.len()
    }

    /// Whether the queue is empty
    pub async fn is_empty(&self) -> bool {
        self.operations.read().await.is_empty()
    }

    /// Drop every queued operation
    pub async fn clear(&self) -> Result<()> {
        self.operations.write().await.clear();
        self.persist(&VecDeque::new()).await
    }

    async fn persist(&self, snapshot: &VecDeque<PendingOperation>) -> Result<()> {
        let bytes = serde_json::to_vec(snapshot)?;
        self.store.set(state_keys::PENDING_OPERATIONS, &bytes).await
    }
}
