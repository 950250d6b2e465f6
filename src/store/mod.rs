//! # Collaborator Traits
//!
//! Seams to the external systems the sync engine composes: the local
//! record store, the secret store, the remote document store, network
//! state, and the owner identity provider. The engine only ever talks to
//! these traits, so tests construct isolated instances instead of
//! touching process-global state.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{RemoteChange, RemoteDocument};

/// Callback invoked for every pushed remote change
pub type ChangeHandler = Arc<dyn Fn(RemoteChange) + Send + Sync>;

/// Callback invoked when connectivity flips; receives the new state
pub type ConnectivityHandler = Arc<dyn Fn(bool) + Send + Sync>;

/// Handle to an active subscription; cancelling detaches the handler.
/// Dropping the handle without cancelling leaves the subscription alive.
pub struct SubscriptionHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    /// Wrap an unsubscribe closure
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Detach the underlying handler
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Ordered key/value store holding local records and persisted engine
/// state. Values are opaque bytes; callers own the serialization.
#[async_trait]
pub trait LocalRecordStore: Send + Sync {
    /// Get a value by key
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a key/value pair
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a key
    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove several keys in one call
    async fn remove_many(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }

    /// List all keys starting with `prefix`
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Opaque, tamper-resistant store for key material
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Read a named secret
    async fn get_secret(&self, name: &str) -> Result<Option<String>>;

    /// Write a named secret
    async fn set_secret(&self, name: &str, value: &str) -> Result<()>;
}

/// Queryable remote document collection keyed by `{owner}_{recordId}`,
/// with push-based change subscription
#[async_trait]
pub trait RemoteDocumentStore: Send + Sync {
    /// Fetch a single document
    async fn get_doc(&self, collection: &str, id: &str) -> Result<Option<RemoteDocument>>;

    /// Write a document. With `merge`, unspecified fields on an existing
    /// document are preserved by the store.
    async fn set_doc(
        &self,
        collection: &str,
        id: &str,
        doc: &RemoteDocument,
        merge: bool,
    ) -> Result<()>;

    /// Delete a single document
    async fn delete_doc(&self, collection: &str, id: &str) -> Result<()>;

    /// All documents belonging to `owner`
    async fn query_owner(&self, collection: &str, owner: &str) -> Result<Vec<RemoteDocument>>;

    /// Delete several documents in one batch
    async fn batch_delete(&self, collection: &str, ids: &[String]) -> Result<()>;

    /// Fetch an untyped auxiliary document (key backups live here)
    async fn get_raw(&self, collection: &str, id: &str) -> Result<Option<serde_json::Value>>;

    /// Write an untyped auxiliary document
    async fn set_raw(&self, collection: &str, id: &str, value: &serde_json::Value) -> Result<()>;

    /// Subscribe to pushed changes for `owner`'s documents
    async fn subscribe(
        &self,
        collection: &str,
        owner: &str,
        handler: ChangeHandler,
    ) -> Result<SubscriptionHandle>;
}

/// Network reachability provider
#[async_trait]
pub trait NetworkState: Send + Sync {
    /// Whether the network is currently reachable
    async fn is_connected(&self) -> bool;

    /// Register for connectivity changes
    fn on_change(&self, handler: ConnectivityHandler) -> SubscriptionHandle;
}

/// Authentication provider, reduced to a stable owner identifier
#[async_trait]
pub trait OwnerIdentity: Send + Sync {
    /// Stable id of the authenticated owner, if any
    async fn current_owner_id(&self) -> Option<String>;
}
