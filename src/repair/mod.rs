//! # Diagnostics and Repair
//!
//! Operator tooling for a sync state that has drifted: a read-only
//! health report over the owner's remote documents, plus targeted repair
//! actions (bulk re-encryption to the current key, purging corrupted
//! documents, resetting the circuit breaker, clearing the ignore-list).
//!
//! Repairs are deliberately separate from the sync cycle: the engine
//! degrades safely on its own, and these tools are for when a human has
//! looked at the report and decided what to do.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::sync::breaker::BreakerSnapshot;
use crate::sync::{SyncEngine, RECORDS_COLLECTION};
use crate::types::{now_ms, state_keys, RemoteDocument};

/// How a single remote document was classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DocumentHealth {
    /// Decrypts with the current key
    Healthy,
    /// Decrypts, but only with a legacy key
    LegacyEncrypted,
    /// Flagged corrupted by a previous sync cycle
    FlaggedCorrupted,
    /// No available key decrypts it
    Undecryptable,
    /// Owner field does not match the signed-in owner
    ForeignOwner,
    /// On the local ignore-list
    Ignored,
}

/// One classified document in the report
#[derive(Debug, Clone, Serialize)]
pub struct DocumentFinding {
    /// Record the document mirrors
    pub record_id: Uuid,
    /// Classification result
    pub health: DocumentHealth,
}

/// Snapshot of everything an operator needs to decide on a repair
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    /// When the report was generated (ms)
    pub generated_at: i64,
    /// Per-document findings
    pub documents: Vec<DocumentFinding>,
    /// Operations still waiting for replay
    pub pending_operations: usize,
    /// Circuit breaker state
    pub breaker: BreakerSnapshot,
    /// Current encryption key version
    pub key_version: u32,
    /// Archived legacy keys still held
    pub legacy_key_count: usize,
    /// Uploads skipped because a peer's document already existed
    pub skipped_uploads: usize,
}

impl DiagnosticsReport {
    /// Number of documents with the given classification
    pub fn count(&self, health: DocumentHealth) -> usize {
        self.documents
            .iter()
            .filter(|f| f.health == health)
            .count()
    }

    /// Whether any finding calls for operator attention
    pub fn needs_attention(&self) -> bool {
        self.documents.iter().any(|f| {
            matches!(
                f.health,
                DocumentHealth::FlaggedCorrupted
                    | DocumentHealth::Undecryptable
                    | DocumentHealth::Ignored
            )
        })
    }
}

/// Repair facade over a sync engine
pub struct SyncDoctor {
    engine: Arc<SyncEngine>,
}

impl SyncDoctor {
    /// Wrap an engine for diagnostics
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    /// Classify every remote document of the signed-in owner without
    /// mutating anything
    pub async fn analyze(&self) -> Result<DiagnosticsReport> {
        let owner = self.owner().await?;
        let ignore = self
            .engine
            .load_id_set(state_keys::CORRUPTED_IGNORE_LIST)
            .await?;
        let docs = self
            .engine
            .remote_store()
            .query_owner(RECORDS_COLLECTION, &owner)
            .await?;

        let mut findings = Vec::with_capacity(docs.len());
        for doc in docs {
            let health = if doc.owner != owner {
                DocumentHealth::ForeignOwner
            } else if ignore.contains(&doc.record_id) {
                DocumentHealth::Ignored
            } else if doc.is_corrupted {
                DocumentHealth::FlaggedCorrupted
            } else {
                match self.engine.crypto().decrypt(&doc.envelope).await {
                    Ok(outcome) if outcome.used_legacy_key => DocumentHealth::LegacyEncrypted,
                    Ok(_) => DocumentHealth::Healthy,
                    Err(SyncError::Decryption { .. }) => DocumentHealth::Undecryptable,
                    Err(other) => return Err(other),
                }
            };
            findings.push(DocumentFinding {
                record_id: doc.record_id,
                health,
            });
        }

        Ok(DiagnosticsReport {
            generated_at: now_ms(),
            documents: findings,
            pending_operations: self.engine.pending_operations().await,
            breaker: self.engine.breaker().snapshot().await,
            key_version: self.engine.crypto().key_version().await?,
            legacy_key_count: self.engine.crypto().legacy_key_count().await?,
            skipped_uploads: self
                .engine
                .load_id_set(state_keys::SKIPPED_UPLOAD_IDS)
                .await?
                .len(),
        })
    }

    /// Re-encrypt every document that only a legacy key could read, so
    /// legacy keys can eventually be discarded. Returns the number
    /// migrated; documents that fail to re-upload are left as they were.
    pub async fn reencrypt_legacy(&self) -> Result<usize> {
        let owner = self.owner().await?;
        let docs = self
            .engine
            .remote_store()
            .query_owner(RECORDS_COLLECTION, &owner)
            .await?;

        let mut migrated = 0;
        for doc in docs {
            if doc.owner != owner || doc.is_corrupted {
                continue;
            }
            let outcome = match self.engine.crypto().decrypt(&doc.envelope).await {
                Ok(outcome) if outcome.used_legacy_key => outcome,
                Ok(_) => continue,
                Err(SyncError::Decryption { .. }) => continue,
                Err(other) => return Err(other),
            };

            let envelope = self.engine.crypto().encrypt(&outcome.measurement).await?;
            let fresh = RemoteDocument {
                envelope,
                last_modified: now_ms(),
                is_corrupted: false,
                ..doc.clone()
            };
            match self
                .engine
                .remote_store()
                .set_doc(RECORDS_COLLECTION, &doc.id(), &fresh, false)
                .await
            {
                Ok(()) => migrated += 1,
                Err(e) => warn!(record_id = %doc.record_id, "re-encryption upload failed: {}", e),
            }
        }

        if migrated > 0 {
            info!(migrated, "re-encrypted legacy documents to current key");
        }
        Ok(migrated)
    }

    /// Delete every flagged or undecryptable remote document and drop
    /// the purged ids from the ignore-list. Returns the number purged.
    /// The plaintext is unrecoverable; callers confirm with the operator
    /// before invoking this.
    pub async fn purge_corrupted(&self) -> Result<usize> {
        let owner = self.owner().await?;
        let docs = self
            .engine
            .remote_store()
            .query_owner(RECORDS_COLLECTION, &owner)
            .await?;

        let mut doomed_ids = Vec::new();
        let mut doomed_records = Vec::new();
        for doc in docs {
            if doc.owner != owner {
                continue;
            }
            let corrupted = doc.is_corrupted
                || matches!(
                    self.engine.crypto().decrypt(&doc.envelope).await,
                    Err(SyncError::Decryption { .. })
                );
            if corrupted {
                doomed_ids.push(doc.id());
                doomed_records.push(doc.record_id);
            }
        }
        if doomed_ids.is_empty() {
            return Ok(0);
        }

        self.engine
            .remote_store()
            .batch_delete(RECORDS_COLLECTION, &doomed_ids)
            .await?;

        // Purged ids no longer need ignoring or upload skipping.
        for key in [
            state_keys::CORRUPTED_IGNORE_LIST,
            state_keys::SKIPPED_UPLOAD_IDS,
        ] {
            let mut set = self.engine.load_id_set(key).await?;
            let before = set.len();
            for id in &doomed_records {
                set.remove(id);
            }
            if set.len() != before {
                self.engine
                    .local_store()
                    .set(key, &serde_json::to_vec(&set)?)
                    .await?;
            }
        }

        info!(purged = doomed_ids.len(), "purged corrupted remote documents");
        Ok(doomed_ids.len())
    }

    /// Close the circuit breaker and wipe its failure history
    pub async fn reset_breaker(&self) -> Result<()> {
        self.engine.breaker().reset().await
    }

    /// Forget every locally ignored record id, so the next sync fetches
    /// them again
    pub async fn clear_ignore_list(&self) -> Result<()> {
        self.engine.clear_ignore_list().await
    }

    async fn owner(&self) -> Result<String> {
        self.engine
            .identity()
            .current_owner_id()
            .await
            .ok_or(SyncError::NotAuthenticated)
    }
}
