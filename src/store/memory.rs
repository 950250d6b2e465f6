//! # In-Memory Collaborators
//!
//! Reference implementations of the collaborator traits backed by plain
//! maps. The sync engine's tests are built on these; the failure and
//! connectivity toggles simulate flaky networks and corrupt remote state
//! without any external services.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Result, SyncError};
use crate::store::{
    ChangeHandler, ConnectivityHandler, LocalRecordStore, NetworkState, OwnerIdentity,
    RemoteDocumentStore, SecretStore, SubscriptionHandle,
};
use crate::types::{RemoteChange, RemoteDocument};

/// In-memory ordered key/value store
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryLocalStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a local-store error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl LocalRecordStore for MemoryLocalStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::local_store("simulated write failure"));
        }
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::local_store("simulated write failure"));
        }
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// In-memory secret store
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<String, String>>,
}

impl MemorySecretStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>> {
        Ok(self.secrets.read().await.get(name).cloned())
    }

    async fn set_secret(&self, name: &str, value: &str) -> Result<()> {
        self.secrets
            .write()
            .await
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}

type SubscriberMap = HashMap<u64, (String, ChangeHandler)>;

/// In-memory remote document store with push notifications
#[derive(Default)]
pub struct MemoryRemoteStore {
    docs: RwLock<HashMap<String, RemoteDocument>>,
    raw_docs: RwLock<HashMap<String, serde_json::Value>>,
    subscribers: Arc<std::sync::Mutex<SubscriberMap>>,
    next_subscriber_id: AtomicU64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    write_count: AtomicU64,
}

impl MemoryRemoteStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent read fail with a remote-store error
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail with a remote-store error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful document writes so far
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Insert a document directly, bypassing failure toggles and
    /// notifications. Used to seed test fixtures.
    pub async fn seed_doc(&self, collection: &str, id: &str, doc: RemoteDocument) {
        self.docs
            .write()
            .await
            .insert(Self::full_key(collection, id), doc);
    }

    fn full_key(collection: &str, id: &str) -> String {
        format!("{}/{}", collection, id)
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SyncError::remote_store("simulated read failure"));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::remote_store("simulated write failure"));
        }
        Ok(())
    }

    fn notify(&self, change: RemoteChange) {
        // Handlers are invoked outside the docs lock; clone them first.
        let handlers: Vec<ChangeHandler> = {
            let subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
            subscribers
                .values()
                .filter(|(owner, _)| *owner == change.owner)
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };
        for handler in handlers {
            handler(change.clone());
        }
    }
}

#[async_trait]
impl RemoteDocumentStore for MemoryRemoteStore {
    async fn get_doc(&self, collection: &str, id: &str) -> Result<Option<RemoteDocument>> {
        self.check_read()?;
        Ok(self
            .docs
            .read()
            .await
            .get(&Self::full_key(collection, id))
            .cloned())
    }

    async fn set_doc(
        &self,
        collection: &str,
        id: &str,
        doc: &RemoteDocument,
        merge: bool,
    ) -> Result<()> {
        self.check_write()?;
        let key = Self::full_key(collection, id);
        {
            let mut docs = self.docs.write().await;
            if merge {
                // Only the corruption flag is ever merge-written; keep the
                // rest of an existing document intact.
                if let Some(existing) = docs.get_mut(&key) {
                    existing.is_corrupted = doc.is_corrupted;
                    existing.last_modified = doc.last_modified;
                } else {
                    docs.insert(key, doc.clone());
                }
            } else {
                docs.insert(key, doc.clone());
            }
        }
        self.write_count.fetch_add(1, Ordering::SeqCst);
        self.notify(RemoteChange {
            owner: doc.owner.clone(),
            record_id: Some(doc.record_id),
        });
        Ok(())
    }

    async fn delete_doc(&self, collection: &str, id: &str) -> Result<()> {
        self.check_write()?;
        let removed = self
            .docs
            .write()
            .await
            .remove(&Self::full_key(collection, id));
        if let Some(doc) = removed {
            self.notify(RemoteChange {
                owner: doc.owner,
                record_id: Some(doc.record_id),
            });
        }
        Ok(())
    }

    async fn query_owner(&self, collection: &str, owner: &str) -> Result<Vec<RemoteDocument>> {
        self.check_read()?;
        let prefix = format!("{}/", collection);
        Ok(self
            .docs
            .read()
            .await
            .iter()
            .filter(|(k, doc)| k.starts_with(&prefix) && doc.owner == owner)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn batch_delete(&self, collection: &str, ids: &[String]) -> Result<()> {
        self.check_write()?;
        let mut docs = self.docs.write().await;
        for id in ids {
            docs.remove(&Self::full_key(collection, id));
        }
        Ok(())
    }

    async fn get_raw(&self, collection: &str, id: &str) -> Result<Option<serde_json::Value>> {
        self.check_read()?;
        Ok(self
            .raw_docs
            .read()
            .await
            .get(&Self::full_key(collection, id))
            .cloned())
    }

    async fn set_raw(&self, collection: &str, id: &str, value: &serde_json::Value) -> Result<()> {
        self.check_write()?;
        self.raw_docs
            .write()
            .await
            .insert(Self::full_key(collection, id), value.clone());
        Ok(())
    }

    async fn subscribe(
        &self,
        _collection: &str,
        owner: &str,
        handler: ChangeHandler,
    ) -> Result<SubscriptionHandle> {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, (owner.to_string(), handler));

        let subscribers = Arc::clone(&self.subscribers);
        Ok(SubscriptionHandle::new(move || {
            subscribers
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&id);
        }))
    }
}

type ConnectivityMap = HashMap<u64, ConnectivityHandler>;

/// In-memory network state with a connectivity toggle
pub struct MemoryNetwork {
    connected: AtomicBool,
    handlers: Arc<std::sync::Mutex<ConnectivityMap>>,
    next_handler_id: AtomicU64,
}

impl MemoryNetwork {
    /// Create a network in the given initial state
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            handlers: Arc::new(std::sync::Mutex::new(HashMap::new())),
            next_handler_id: AtomicU64::new(0),
        }
    }

    /// Flip connectivity, notifying registered handlers
    pub fn set_connected(&self, connected: bool) {
        let previous = self.connected.swap(connected, Ordering::SeqCst);
        if previous == connected {
            return;
        }
        let handlers: Vec<ConnectivityHandler> = {
            let map = self.handlers.lock().unwrap_or_else(|p| p.into_inner());
            map.values().map(Arc::clone).collect()
        };
        for handler in handlers {
            handler(connected);
        }
    }
}

#[async_trait]
impl NetworkState for MemoryNetwork {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn on_change(&self, handler: ConnectivityHandler) -> SubscriptionHandle {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, handler);

        let handlers = Arc::clone(&self.handlers);
        SubscriptionHandle::new(move || {
            handlers.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
        })
    }
}

/// Owner identity fixed at construction
#[derive(Debug, Clone)]
pub struct StaticOwner {
    owner_id: Option<String>,
}

impl StaticOwner {
    /// An authenticated owner with the given id
    pub fn signed_in(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
        }
    }

    /// No authenticated owner
    pub fn signed_out() -> Self {
        Self { owner_id: None }
    }
}

#[async_trait]
impl OwnerIdentity for StaticOwner {
    async fn current_owner_id(&self) -> Option<String> {
        self.owner_id.clone()
    }
}
