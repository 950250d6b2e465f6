//! # Sync Engine
//!
//! Composes the encryption service, pending operation queue, and
//! corruption circuit breaker into the add/delete/list/sync operations of
//! the offline-first store.
//!
//! ## Control Flow
//!
//! Every mutation writes to the local record store first, then attempts
//! the remote write only when sync is enabled, an owner identity exists,
//! the circuit breaker is closed, and the network is reachable.
//! Deferrable remote failures (connectivity, remote store, open breaker)
//! enqueue a pending operation instead of surfacing to the caller;
//! anything else is a real fault the caller must see. Background triggers (connectivity restored, realtime change,
//! explicit request) invoke [`SyncEngine::sync_with_cloud`], which drains
//! the pending queue, fetches and decrypts remote records, and merges
//! them with local state.
//!
//! ## Concurrency
//!
//! `sync_with_cloud` is single-flight: an in-progress flag is checked
//! synchronously before any suspension point, and concurrent callers
//! return without error. A minimum inter-call interval coalesces
//! thundering-herd triggers from overlapping listeners. The merge is
//! commutative and idempotent, which keeps races between the realtime
//! listener and manual syncs harmless.

pub mod breaker;
pub mod listener;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::crypto::EncryptionService;
use crate::error::{Result, SyncError};
use crate::offline::{OperationKind, PendingOperation, PendingOperationQueue};
use crate::store::{
    LocalRecordStore, NetworkState, OwnerIdentity, RemoteDocumentStore,
};
use crate::types::{
    now_ms, record_local_key, state_keys, Measurement, NewMeasurement, RemoteDocument,
    SyncMetadata,
};

use self::breaker::CorruptionBreaker;

/// Remote collection holding encrypted record mirrors
pub const RECORDS_COLLECTION: &str = "records";
/// Breaker scope guarding the sync cycle
const SYNC_BREAKER_SCOPE: &str = "sync";

/// Counters describing one sync cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncOutcome {
    /// Whether a cycle actually ran (guards can skip it without error)
    pub performed: bool,
    /// Pending operations replayed successfully
    pub drained: usize,
    /// Remote records appended locally
    pub downloaded: usize,
    /// Local records uploaded remotely
    pub uploaded: usize,
    /// Remote documents newly classified as corrupted
    pub corrupted: usize,
}

/// Result of one upload attempt
enum UploadResult {
    /// Document written
    Written,
    /// A well-formed document already existed; upload skipped
    SkippedExisting,
}

/// The sync orchestrator. Construct with injected collaborators via
/// [`SyncEngine::new`]; tests build isolated instances on the in-memory
/// collaborators.
pub struct SyncEngine {
    config: SyncConfig,
    local: Arc<dyn LocalRecordStore>,
    remote: Arc<dyn RemoteDocumentStore>,
    network: Arc<dyn NetworkState>,
    identity: Arc<dyn OwnerIdentity>,
    crypto: Arc<EncryptionService>,
    queue: PendingOperationQueue,
    breaker: Arc<CorruptionBreaker>,
    /// Single-flight flag for `sync_with_cloud`
    sync_in_progress: AtomicBool,
    /// Wall-clock debounce for sync triggers
    last_sync_attempt: std::sync::Mutex<Option<Instant>>,
    device_id: String,
}

impl SyncEngine {
    /// Load persisted engine state and wire up the collaborators
    pub async fn new(
        config: SyncConfig,
        local: Arc<dyn LocalRecordStore>,
        remote: Arc<dyn RemoteDocumentStore>,
        network: Arc<dyn NetworkState>,
        identity: Arc<dyn OwnerIdentity>,
        crypto: Arc<EncryptionService>,
    ) -> Result<Self> {
        let queue = PendingOperationQueue::load(Arc::clone(&local), &config).await?;
        let breaker = Arc::new(
            CorruptionBreaker::load(Arc::clone(&local), SYNC_BREAKER_SCOPE, &config).await?,
        );
        let device_id = load_or_create_device_id(local.as_ref()).await?;

        Ok(Self {
            config,
            local,
            remote,
            network,
            identity,
            crypto,
            queue,
            breaker,
            sync_in_progress: AtomicBool::new(false),
            last_sync_attempt: std::sync::Mutex::new(None),
            device_id,
        })
    }

    /// The circuit breaker guarding this engine's remote operations
    pub fn breaker(&self) -> &Arc<CorruptionBreaker> {
        &self.breaker
    }

    /// Encryption service used by this engine
    pub fn crypto(&self) -> &Arc<EncryptionService> {
        &self.crypto
    }

    pub(crate) fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub(crate) fn local_store(&self) -> &Arc<dyn LocalRecordStore> {
        &self.local
    }

    pub(crate) fn remote_store(&self) -> &Arc<dyn RemoteDocumentStore> {
        &self.remote
    }

    pub(crate) fn network_state(&self) -> &Arc<dyn NetworkState> {
        &self.network
    }

    pub(crate) fn identity(&self) -> &Arc<dyn OwnerIdentity> {
        &self.identity
    }

    /// Number of operations waiting for replay
    pub async fn pending_operations(&self) -> usize {
        self.queue.len().await
    }

    /// Stable identifier of this device
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Persist the sync-enabled flag
    pub async fn set_sync_enabled(&self, enabled: bool) -> Result<()> {
        self.local
            .set(
                state_keys::SYNC_ENABLED,
                if enabled { b"true" } else { b"false" },
            )
            .await
    }

    /// Whether cloud sync is enabled (defaults to enabled)
    pub async fn sync_enabled(&self) -> bool {
        match self.local.get(state_keys::SYNC_ENABLED).await {
            Ok(Some(bytes)) => bytes != b"false",
            _ => true,
        }
    }

    /// Completion time of the last sync cycle (ms), if any
    pub async fn last_synced_at(&self) -> Option<i64> {
        let bytes = self.local.get(state_keys::LAST_SYNC).await.ok()??;
        String::from_utf8(bytes).ok()?.parse().ok()
    }

    /// Store a new measurement locally, then mirror it remotely when
    /// possible; remote failures enqueue a pending ADD.
    pub async fn add_measurement(&self, input: NewMeasurement) -> Result<Measurement> {
        let record = Measurement::from_input(input);
        // Local write first; local failures always surface.
        self.local
            .set(&record.local_key(), &serde_json::to_vec(&record)?)
            .await?;

        let Some(owner) = self.remote_write_owner().await else {
            return Ok(record);
        };

        if let Err(e) = self.try_remote_add(&owner, &record).await {
            if !e.is_deferrable() {
                return Err(e);
            }
            debug!(record_id = %record.id, "remote add deferred: {}", e);
            self.queue
                .enqueue(PendingOperation::new(
                    OperationKind::Add(record.clone()),
                    record.id,
                ))
                .await?;
        }
        Ok(record)
    }

    /// Attempt the remote half of an add. Connectivity and breaker
    /// rejections come back as deferrable errors for the caller to queue.
    async fn try_remote_add(&self, owner: &str, record: &Measurement) -> Result<()> {
        if !self.network.is_connected().await {
            return Err(SyncError::NetworkUnavailable);
        }
        self.breaker.guard().await?;
        self.upload_record(owner, record).await?;
        self.touch_sync_metadata(&record.id).await
    }

    /// Delete a measurement locally, then remotely when possible; remote
    /// failures enqueue a pending DELETE.
    pub async fn delete_measurement(&self, id: &Uuid) -> Result<()> {
        self.local
            .remove_many(&[record_local_key(id), sync_meta_key(id)])
            .await?;

        let Some(owner) = self.remote_write_owner().await else {
            return Ok(());
        };

        if let Err(e) = self.try_remote_delete(&owner, id).await {
            if !e.is_deferrable() {
                return Err(e);
            }
            debug!(record_id = %id, "remote delete deferred: {}", e);
            self.queue
                .enqueue(PendingOperation::new(OperationKind::Delete, *id))
                .await?;
        }
        Ok(())
    }

    async fn try_remote_delete(&self, owner: &str, id: &Uuid) -> Result<()> {
        if !self.network.is_connected().await {
            return Err(SyncError::NetworkUnavailable);
        }
        self.breaker.guard().await?;
        let doc_id = RemoteDocument::doc_id(owner, id);
        self.remote.delete_doc(RECORDS_COLLECTION, &doc_id).await
    }

    /// List measurements, newest first. With sync available the remote
    /// store is the source of truth (refreshing the local cache); any
    /// remote failure falls back to the local list without raising.
    pub async fn list_measurements(&self) -> Result<Vec<Measurement>> {
        let remote_ready = self.sync_enabled().await
            && self.network.is_connected().await
            && self.breaker.can_execute().await;
        let owner = self.identity.current_owner_id().await;

        if let (true, Some(owner)) = (remote_ready, owner) {
            match self.fetch_remote_records(&owner).await {
                Ok(fetch) => {
                    // Refresh the local cache so offline reads see the
                    // remote truth.
                    for record in &fetch.records {
                        self.local
                            .set(&record.local_key(), &serde_json::to_vec(record)?)
                            .await?;
                    }
                    let mut records = fetch.records;
                    sort_newest_first(&mut records);
                    return Ok(records);
                }
                Err(e) => {
                    warn!("remote list failed, falling back to local: {}", e);
                }
            }
        }

        let mut records = self.local_measurements().await?;
        sort_newest_first(&mut records);
        Ok(records)
    }

    /// Run one full sync cycle: drain the pending queue, fetch and
    /// classify remote records, merge both directions, persist the sync
    /// timestamp.
    ///
    /// Guards: returns `CircuitOpen` when the breaker is open; returns a
    /// non-performed outcome (no error) when a cycle is already running,
    /// the debounce window has not elapsed, no owner is signed in, sync
    /// is disabled, or the network is down.
    pub async fn sync_with_cloud(&self) -> Result<SyncOutcome> {
        // Single-flight and debounce are checked synchronously, before
        // any suspension point.
        if self
            .sync_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync already running, skipping");
            return Ok(SyncOutcome::default());
        }
        let _flight = FlightGuard(&self.sync_in_progress);

        {
            let last = self
                .last_sync_attempt
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(at) = *last {
                if at.elapsed() < self.config.sync_debounce {
                    debug!("sync debounced");
                    return Ok(SyncOutcome::default());
                }
            }
        }

        self.breaker.guard().await?;

        if !self.sync_enabled().await {
            return Ok(SyncOutcome::default());
        }
        let Some(owner) = self.identity.current_owner_id().await else {
            debug!("no owner identity, sync skipped");
            return Ok(SyncOutcome::default());
        };
        if !self.network.is_connected().await {
            debug!("network unavailable, sync skipped");
            return Ok(SyncOutcome::default());
        }

        // The window starts only when a cycle actually runs; a call the
        // guards skipped must not debounce the next one.
        *self
            .last_sync_attempt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());

        let mut outcome = SyncOutcome {
            performed: true,
            ..SyncOutcome::default()
        };

        // (1) Replay deferred mutations.
        outcome.drained = self.drain_pending(&owner).await?;

        // (2) Fetch remote records, classifying undecryptable documents.
        let fetch = self.fetch_remote_records(&owner).await?;
        outcome.corrupted = fetch.corrupted;

        // (3) Merge both directions.
        let (downloaded, uploaded) = self.merge(&owner, &fetch.records).await?;
        outcome.downloaded = downloaded;
        outcome.uploaded = uploaded;

        // (4) Persist completion time.
        self.local
            .set(state_keys::LAST_SYNC, now_ms().to_string().as_bytes())
            .await?;
        self.breaker.record_success().await?;

        info!(
            drained = outcome.drained,
            downloaded = outcome.downloaded,
            uploaded = outcome.uploaded,
            corrupted = outcome.corrupted,
            "sync cycle complete"
        );
        Ok(outcome)
    }

    /// Fetch and merge without the queue drain, used by the realtime
    /// listener (changes it reacts to are remote; local mutations are
    /// picked up by the next full cycle)
    pub(crate) async fn fetch_and_merge(&self, owner: &str) -> Result<()> {
        self.breaker.guard().await?;
        let fetch = self.fetch_remote_records(owner).await?;
        self.merge(owner, &fetch.records).await?;
        self.local
            .set(state_keys::LAST_SYNC, now_ms().to_string().as_bytes())
            .await?;
        Ok(())
    }

    /// Records currently in the local store, unsorted
    pub(crate) async fn local_measurements(&self) -> Result<Vec<Measurement>> {
        let keys = self.local.list_keys(state_keys::RECORD_PREFIX).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(bytes) = self.local.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<Measurement>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!(key, "skipping unreadable local record: {}", e),
            }
        }
        Ok(records)
    }

    /// Owner id, provided sync is enabled; `None` means remote writes
    /// are skipped and the operation stays local-only
    async fn remote_write_owner(&self) -> Option<String> {
        if !self.sync_enabled().await {
            return None;
        }
        self.identity.current_owner_id().await
    }

    /// Replay ready pending operations in FIFO order. Failures back off;
    /// an opening breaker aborts the drain.
    async fn drain_pending(&self, owner: &str) -> Result<usize> {
        let now = now_ms();
        let ready = self.queue.ready_operations(now).await;
        if ready.is_empty() {
            return Ok(0);
        }
        debug!(ready = ready.len(), "draining pending operations");

        let mut drained = 0;
        for op in ready {
            if !self.breaker.can_execute().await {
                debug!("breaker opened mid-drain, stopping");
                break;
            }
            let result = match &op.kind {
                OperationKind::Add(record) => {
                    self.upload_record(owner, record).await.map(|_| ())
                }
                OperationKind::Delete => {
                    let doc_id = RemoteDocument::doc_id(owner, &op.record_id);
                    self.remote.delete_doc(RECORDS_COLLECTION, &doc_id).await
                }
            };
            match result {
                Ok(()) => {
                    self.queue.complete(&op.op_id).await?;
                    drained += 1;
                }
                Err(e) => {
                    debug!(op = op.kind.name(), record_id = %op.record_id, "replay failed: {}", e);
                    self.queue.record_failure(&op.op_id, now).await?;
                }
            }
        }
        Ok(drained)
    }

    /// Fetch every remote record for `owner`, decrypting with any
    /// available key. Undecryptable documents are flagged remotely
    /// (fallback: local ignore-list) and counted against the breaker;
    /// the fetch aborts early if the breaker opens.
    async fn fetch_remote_records(&self, owner: &str) -> Result<RemoteFetch> {
        let ignore = self.load_id_set(state_keys::CORRUPTED_IGNORE_LIST).await?;
        let docs = self.remote.query_owner(RECORDS_COLLECTION, owner).await?;

        let mut fetch = RemoteFetch::default();
        for doc in docs {
            if doc.owner != owner {
                // Never trust a document whose owner mismatches, even if
                // the store returned it.
                warn!(doc_owner = %doc.owner, "skipping foreign-owner document");
                continue;
            }
            if doc.is_corrupted || ignore.contains(&doc.record_id) {
                fetch.skipped += 1;
                continue;
            }

            match self.crypto.decrypt(&doc.envelope).await {
                Ok(outcome) => {
                    if outcome.used_legacy_key {
                        self.migrate_on_read(owner, &outcome.measurement).await;
                    }
                    fetch.records.push(outcome.measurement);
                }
                Err(SyncError::Decryption { message }) => {
                    fetch.corrupted += 1;
                    self.mark_corrupted(&doc).await;
                    let just_opened = self
                        .breaker
                        .record_failure(&format!("undecryptable document {}: {}", doc.id(), message))
                        .await?;
                    if just_opened {
                        warn!("breaker opened during fetch, aborting remainder of cycle");
                        break;
                    }
                }
                Err(other) => return Err(other),
            }
        }
        if fetch.skipped > 0 || fetch.corrupted > 0 {
            debug!(
                skipped = fetch.skipped,
                corrupted = fetch.corrupted,
                "remote fetch excluded unhealthy documents"
            );
        }
        Ok(fetch)
    }

    /// Re-encrypt a record that only a legacy key could read and
    /// overwrite its remote document, migrating it to the current key.
    /// Best-effort: failure leaves the document readable via legacy keys.
    async fn migrate_on_read(&self, owner: &str, record: &Measurement) {
        let result = async {
            let envelope = self.crypto.encrypt(record).await?;
            let doc = self.build_document(owner, record, envelope);
            self.remote
                .set_doc(RECORDS_COLLECTION, &doc.id(), &doc, false)
                .await
        }
        .await;
        match result {
            Ok(()) => debug!(record_id = %record.id, "migrated record to current key"),
            Err(e) => warn!(record_id = %record.id, "migration-on-read failed: {}", e),
        }
    }

    /// Flag a remote document as corrupted; when even the flag write
    /// fails, fall back to the persisted ignore-list so the id stops
    /// being fetched.
    async fn mark_corrupted(&self, doc: &RemoteDocument) {
        let mut flagged = doc.clone();
        flagged.is_corrupted = true;
        flagged.last_modified = now_ms();
        match self
            .remote
            .set_doc(RECORDS_COLLECTION, &doc.id(), &flagged, true)
            .await
        {
            Ok(()) => info!(record_id = %doc.record_id, "flagged corrupted remote document"),
            Err(e) => {
                warn!(record_id = %doc.record_id, "corruption flag write failed ({}), using ignore-list", e);
                if let Err(e) = self
                    .add_to_id_set(state_keys::CORRUPTED_IGNORE_LIST, &doc.record_id)
                    .await
                {
                    warn!(record_id = %doc.record_id, "ignore-list update failed: {}", e);
                }
            }
        }
    }

    /// Two-way merge: append remote-only records locally, upload
    /// local-only records (skipping ignored ids)
    async fn merge(&self, owner: &str, remote_records: &[Measurement]) -> Result<(usize, usize)> {
        let local_records = self.local_measurements().await?;
        let local_ids: HashSet<Uuid> = local_records.iter().map(|r| r.id).collect();
        let remote_ids: HashSet<Uuid> = remote_records.iter().map(|r| r.id).collect();
        let ignore = self.load_id_set(state_keys::CORRUPTED_IGNORE_LIST).await?;
        // Records with a queued operation are the drain's job; uploading
        // them here would race it and duplicate queue entries.
        let pending = self.queue.pending_record_ids().await;
        // Ids whose upload was once skipped because a peer's document
        // already existed. If that document is gone now the peer deleted
        // it, and re-uploading would resurrect the record. Entries for
        // ids no longer known on either side are pruned.
        let mut skipped_uploads = self.load_id_set(state_keys::SKIPPED_UPLOAD_IDS).await?;
        let before = skipped_uploads.len();
        skipped_uploads.retain(|id| local_ids.contains(id) || remote_ids.contains(id));
        if skipped_uploads.len() != before {
            self.local
                .set(
                    state_keys::SKIPPED_UPLOAD_IDS,
                    &serde_json::to_vec(&skipped_uploads)?,
                )
                .await?;
        }

        let mut downloaded = 0;
        for record in remote_records {
            if !local_ids.contains(&record.id) {
                self.local
                    .set(&record.local_key(), &serde_json::to_vec(record)?)
                    .await?;
                self.touch_sync_metadata(&record.id).await?;
                downloaded += 1;
            }
        }

        let mut uploaded = 0;
        for record in &local_records {
            if remote_ids.contains(&record.id)
                || ignore.contains(&record.id)
                || pending.contains(&record.id)
                || skipped_uploads.contains(&record.id)
            {
                continue;
            }
            if !self.breaker.can_execute().await {
                debug!("breaker opened mid-merge, stopping uploads");
                break;
            }
            match self.upload_record(owner, record).await {
                Ok(UploadResult::Written) => {
                    self.touch_sync_metadata(&record.id).await?;
                    uploaded += 1;
                }
                Ok(UploadResult::SkippedExisting) => {}
                Err(SyncError::CircuitOpen { .. }) => {
                    debug!("breaker opened mid-merge, stopping uploads");
                    break;
                }
                Err(e) if e.is_deferrable() => {
                    warn!(record_id = %record.id, "merge upload failed, queueing: {}", e);
                    self.queue
                        .enqueue(PendingOperation::new(
                            OperationKind::Add(record.clone()),
                            record.id,
                        ))
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }

        Ok((downloaded, uploaded))
    }

    /// Upload one record, checking for an existing remote document
    /// first. A well-formed existing document wins (idempotent no-op,
    /// remembered on the skipped-upload list); a corrupted one is counted
    /// against the breaker and overwritten.
    async fn upload_record(&self, owner: &str, record: &Measurement) -> Result<UploadResult> {
        let doc_id = RemoteDocument::doc_id(owner, &record.id);

        if let Some(existing) = self.remote.get_doc(RECORDS_COLLECTION, &doc_id).await? {
            let well_formed =
                !existing.is_corrupted && self.crypto.decrypt(&existing.envelope).await.is_ok();
            if well_formed {
                // Another device already wrote this id; do not clobber it.
                debug!(record_id = %record.id, "remote document already present, skipping upload");
                self.add_to_id_set(state_keys::SKIPPED_UPLOAD_IDS, &record.id)
                    .await?;
                return Ok(UploadResult::SkippedExisting);
            }
            let just_opened = self
                .breaker
                .record_failure(&format!("corrupted document at upload target {}", doc_id))
                .await?;
            if just_opened {
                return Err(SyncError::circuit_open(SYNC_BREAKER_SCOPE));
            }
            info!(record_id = %record.id, "overwriting corrupted remote document");
        }

        let envelope = self.crypto.encrypt(record).await?;
        let doc = self.build_document(owner, record, envelope);
        self.remote
            .set_doc(RECORDS_COLLECTION, &doc_id, &doc, false)
            .await?;
        Ok(UploadResult::Written)
    }

    fn build_document(&self, owner: &str, record: &Measurement, envelope: String) -> RemoteDocument {
        RemoteDocument {
            owner: owner.to_string(),
            record_id: record.id,
            envelope,
            plaintext_timestamp: record.timestamp,
            last_modified: now_ms(),
            is_corrupted: false,
        }
    }

    /// Bump the per-record sync metadata for this device
    async fn touch_sync_metadata(&self, record_id: &Uuid) -> Result<()> {
        let key = sync_meta_key(record_id);
        let version = match self.local.get(&key).await? {
            Some(bytes) => serde_json::from_slice::<SyncMetadata>(&bytes)
                .map(|m| m.version + 1)
                .unwrap_or(1),
            None => 1,
        };
        let meta = SyncMetadata {
            record_id: *record_id,
            version,
            last_synced_at: now_ms(),
            device_id: self.device_id.clone(),
        };
        self.local.set(&key, &serde_json::to_vec(&meta)?).await
    }

    /// Persisted ids the fetch/merge paths must leave alone
    pub(crate) async fn load_id_set(&self, key: &str) -> Result<HashSet<Uuid>> {
        match self.local.get(key).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            None => Ok(HashSet::new()),
        }
    }

    async fn add_to_id_set(&self, key: &str, id: &Uuid) -> Result<()> {
        let mut set = self.load_id_set(key).await?;
        if set.insert(*id) {
            self.local.set(key, &serde_json::to_vec(&set)?).await?;
        }
        Ok(())
    }

    /// Clear the persisted corrupted ignore-list (repair tooling)
    pub(crate) async fn clear_ignore_list(&self) -> Result<()> {
        self.local.remove(state_keys::CORRUPTED_IGNORE_LIST).await
    }
}

/// Results of a remote fetch pass
#[derive(Debug, Default)]
struct RemoteFetch {
    records: Vec<Measurement>,
    corrupted: usize,
    skipped: usize,
}

/// Clears the in-progress flag when the cycle ends, however it ends
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn sync_meta_key(id: &Uuid) -> String {
    format!("{}{}", state_keys::SYNC_META_PREFIX, id)
}

fn sort_newest_first(records: &mut [Measurement]) {
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
}

async fn load_or_create_device_id(local: &dyn LocalRecordStore) -> Result<String> {
    if let Some(bytes) = local.get(state_keys::DEVICE_ID).await? {
        if let Ok(id) = String::from_utf8(bytes) {
            return Ok(id);
        }
    }
    let id = Uuid::new_v4().to_string();
    local.set(state_keys::DEVICE_ID, id.as_bytes()).await?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryLocalStore, MemoryNetwork, MemoryRemoteStore, StaticOwner};
    use crate::store::SecretStore;
    use crate::store::memory::MemorySecretStore;

    struct Harness {
        engine: SyncEngine,
        local: Arc<MemoryLocalStore>,
        remote: Arc<MemoryRemoteStore>,
        network: Arc<MemoryNetwork>,
    }

    async fn harness(owner: StaticOwner, connected: bool) -> Harness {
        harness_with(SyncConfig::for_tests(), owner, connected).await
    }

    async fn harness_with(config: SyncConfig, owner: StaticOwner, connected: bool) -> Harness {
        let local = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        let network = Arc::new(MemoryNetwork::new(connected));
        let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        let crypto = Arc::new(EncryptionService::new(secrets, config.clone()));

        let engine = SyncEngine::new(
            config,
            Arc::clone(&local) as Arc<dyn LocalRecordStore>,
            Arc::clone(&remote) as Arc<dyn RemoteDocumentStore>,
            Arc::clone(&network) as Arc<dyn NetworkState>,
            Arc::new(owner),
            crypto,
        )
        .await
        .unwrap();

        Harness {
            engine,
            local,
            remote,
            network,
        }
    }

    fn input(value: f64) -> NewMeasurement {
        NewMeasurement {
            value,
            kind: "fasting".to_string(),
            timestamp: now_ms(),
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_add_writes_local_then_remote() {
        let h = harness(StaticOwner::signed_in("owner-1"), true).await;
        let record = h.engine.add_measurement(input(120.0)).await.unwrap();

        // Local copy exists.
        let bytes = h.local.get(&record.local_key()).await.unwrap().unwrap();
        let stored: Measurement = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(stored, record);

        // Remote mirror exists under {owner}_{recordId} and decrypts.
        let doc_id = RemoteDocument::doc_id("owner-1", &record.id);
        let doc = h
            .remote
            .get_doc(RECORDS_COLLECTION, &doc_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.plaintext_timestamp, record.timestamp);
        let outcome = h.engine.crypto().decrypt(&doc.envelope).await.unwrap();
        assert_eq!(outcome.measurement, record);
        assert_eq!(h.engine.pending_operations().await, 0);
    }

    #[tokio::test]
    async fn test_add_offline_enqueues_without_attempting() {
        let h = harness(StaticOwner::signed_in("owner-1"), false).await;
        let record = h.engine.add_measurement(input(120.0)).await.unwrap();

        assert!(h.local.get(&record.local_key()).await.unwrap().is_some());
        assert_eq!(h.engine.pending_operations().await, 1);
        assert_eq!(h.remote.write_count(), 0);
    }

    #[tokio::test]
    async fn test_add_signed_out_stays_local() {
        let h = harness(StaticOwner::signed_out(), true).await;
        let record = h.engine.add_measurement(input(95.0)).await.unwrap();

        assert!(h.local.get(&record.local_key()).await.unwrap().is_some());
        assert_eq!(h.engine.pending_operations().await, 0);
        assert_eq!(h.remote.write_count(), 0);
    }

    #[tokio::test]
    async fn test_add_remote_failure_enqueues() {
        let h = harness(StaticOwner::signed_in("owner-1"), true).await;
        h.remote.set_fail_writes(true);

        let record = h.engine.add_measurement(input(101.0)).await.unwrap();
        assert!(h.local.get(&record.local_key()).await.unwrap().is_some());
        assert_eq!(h.engine.pending_operations().await, 1);
    }

    #[tokio::test]
    async fn test_delete_removes_both_sides() {
        let h = harness(StaticOwner::signed_in("owner-1"), true).await;
        let record = h.engine.add_measurement(input(130.0)).await.unwrap();

        h.engine.delete_measurement(&record.id).await.unwrap();

        assert!(h.local.get(&record.local_key()).await.unwrap().is_none());
        let doc_id = RemoteDocument::doc_id("owner-1", &record.id);
        assert!(h
            .remote
            .get_doc(RECORDS_COLLECTION, &doc_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_list_falls_back_to_local_on_remote_failure() {
        let h = harness(StaticOwner::signed_in("owner-1"), true).await;
        let record = h.engine.add_measurement(input(111.0)).await.unwrap();

        h.remote.set_fail_reads(true);
        let records = h.engine.list_measurements().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, record.id);
    }

    #[tokio::test]
    async fn test_list_is_newest_first() {
        let h = harness(StaticOwner::signed_out(), false).await;
        let t0 = now_ms();
        for (offset, value) in [(0, 1.0), (2000, 2.0), (1000, 3.0)] {
            h.engine
                .add_measurement(NewMeasurement {
                    value,
                    kind: "fasting".to_string(),
                    timestamp: t0 + offset,
                    notes: None,
                })
                .await
                .unwrap();
        }
        let records = h.engine.list_measurements().await.unwrap();
        let values: Vec<f64> = records.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 1.0]);
    }

    #[tokio::test]
    async fn test_sync_skips_without_owner() {
        let h = harness(StaticOwner::signed_out(), true).await;
        let outcome = h.engine.sync_with_cloud().await.unwrap();
        assert!(!outcome.performed);
    }

    #[tokio::test]
    async fn test_sync_surfaces_circuit_open() {
        let h = harness(StaticOwner::signed_in("owner-1"), true).await;
        for _ in 0..5 {
            h.engine.breaker().record_failure("x").await.unwrap();
        }
        let err = h.engine.sync_with_cloud().await.unwrap_err();
        assert!(matches!(err, SyncError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_upload_skips_well_formed_existing() {
        let h = harness(StaticOwner::signed_in("owner-1"), true).await;
        let record = h.engine.add_measurement(input(99.0)).await.unwrap();
        let writes_after_add = h.remote.write_count();

        // Re-uploading the same record is an idempotent no-op.
        let result = h.engine.upload_record("owner-1", &record).await.unwrap();
        assert!(matches!(result, UploadResult::SkippedExisting));
        assert_eq!(h.remote.write_count(), writes_after_add);

        let skipped = h
            .engine
            .load_id_set(state_keys::SKIPPED_UPLOAD_IDS)
            .await
            .unwrap();
        assert!(skipped.contains(&record.id));
    }

    #[tokio::test]
    async fn test_upload_overwrites_corrupted_existing() {
        let h = harness(StaticOwner::signed_in("owner-1"), true).await;
        let record = h.engine.add_measurement(input(88.0)).await.unwrap();

        // Corrupt the remote mirror.
        let doc_id = RemoteDocument::doc_id("owner-1", &record.id);
        let mut doc = h
            .remote
            .get_doc(RECORDS_COLLECTION, &doc_id)
            .await
            .unwrap()
            .unwrap();
        doc.envelope = "v1|aabbccddeeff|00112233445566778899aabbccddeeff:deadbeef".to_string();
        h.remote.seed_doc(RECORDS_COLLECTION, &doc_id, doc).await;

        let result = h.engine.upload_record("owner-1", &record).await.unwrap();
        assert!(matches!(result, UploadResult::Written));

        let repaired = h
            .remote
            .get_doc(RECORDS_COLLECTION, &doc_id)
            .await
            .unwrap()
            .unwrap();
        let outcome = h.engine.crypto().decrypt(&repaired.envelope).await.unwrap();
        assert_eq!(outcome.measurement, record);
        // The corruption was counted against the breaker.
        assert!(h.engine.breaker().snapshot().await.failure_count >= 1.0);
    }

    #[tokio::test]
    async fn test_offline_remote_add_is_deferrable() {
        let h = harness(StaticOwner::signed_in("owner-1"), false).await;
        let record = Measurement::from_input(input(70.0));

        let err = h.engine.try_remote_add("owner-1", &record).await.unwrap_err();
        assert!(matches!(err, SyncError::NetworkUnavailable));
        assert!(err.is_deferrable());
        assert_eq!(h.remote.write_count(), 0);
    }

    #[tokio::test]
    async fn test_merge_does_not_resurrect_skipped_upload() {
        let h = harness(StaticOwner::signed_in("owner-1"), true).await;
        let record = h.engine.add_measurement(input(77.0)).await.unwrap();

        // A peer saw the same id remotely and then deleted the document.
        h.engine
            .add_to_id_set(state_keys::SKIPPED_UPLOAD_IDS, &record.id)
            .await
            .unwrap();
        let doc_id = RemoteDocument::doc_id("owner-1", &record.id);
        h.remote
            .delete_doc(RECORDS_COLLECTION, &doc_id)
            .await
            .unwrap();

        let outcome = h.engine.sync_with_cloud().await.unwrap();
        assert!(outcome.performed);
        assert_eq!(outcome.uploaded, 0);
        assert!(h
            .remote
            .get_doc(RECORDS_COLLECTION, &doc_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_merge_prunes_stale_skip_list_entries() {
        let h = harness(StaticOwner::signed_in("owner-1"), true).await;
        let live = h.engine.add_measurement(input(66.0)).await.unwrap();
        h.engine
            .add_to_id_set(state_keys::SKIPPED_UPLOAD_IDS, &live.id)
            .await
            .unwrap();
        // An id no longer known on either side.
        h.engine
            .add_to_id_set(state_keys::SKIPPED_UPLOAD_IDS, &Uuid::new_v4())
            .await
            .unwrap();

        h.engine.sync_with_cloud().await.unwrap();

        let skipped = h
            .engine
            .load_id_set(state_keys::SKIPPED_UPLOAD_IDS)
            .await
            .unwrap();
        assert_eq!(skipped.len(), 1);
        assert!(skipped.contains(&live.id));
    }

    #[tokio::test]
    async fn test_skipped_cycle_does_not_consume_debounce_window() {
        let mut config = SyncConfig::for_tests();
        config.sync_debounce = std::time::Duration::from_secs(60);
        let h = harness_with(config, StaticOwner::signed_in("owner-1"), false).await;

        // The guards skip this call without starting the window.
        let outcome = h.engine.sync_with_cloud().await.unwrap();
        assert!(!outcome.performed);

        // Reconnecting right afterwards syncs immediately.
        h.network.set_connected(true);
        let outcome = h.engine.sync_with_cloud().await.unwrap();
        assert!(outcome.performed);

        // Now a cycle has run, so the window is in effect.
        let outcome = h.engine.sync_with_cloud().await.unwrap();
        assert!(!outcome.performed);
    }

    #[tokio::test]
    async fn test_device_id_stable_across_engines() {
        let local: Arc<dyn LocalRecordStore> = Arc::new(MemoryLocalStore::new());
        let first = load_or_create_device_id(local.as_ref()).await.unwrap();
        let second = load_or_create_device_id(local.as_ref()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_offline_add_then_reconnect_drains_queue() {
        let h = harness(StaticOwner::signed_in("owner-1"), false).await;
        let record = h.engine.add_measurement(input(120.0)).await.unwrap();
        assert_eq!(h.engine.pending_operations().await, 1);

        h.network.set_connected(true);
        let outcome = h.engine.sync_with_cloud().await.unwrap();
        assert!(outcome.performed);
        assert_eq!(outcome.drained, 1);
        assert_eq!(h.engine.pending_operations().await, 0);

        // Exactly one remote document exists for the record.
        let docs = h
            .remote
            .query_owner(RECORDS_COLLECTION, "owner-1")
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].record_id, record.id);
    }
}
