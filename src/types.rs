//! # Core Domain Types
//!
//! Measurement records, their encrypted remote mirror, and the
//! bookkeeping types shared across the sync engine.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical names of all persisted state entries in the local store and
/// secret store. Kept in one place so diagnostics can enumerate them.
pub mod state_keys {
    /// Secret store: hex-encoded current symmetric key
    pub const CURRENT_KEY: &str = "current-key";
    /// Secret store: JSON list of hex-encoded superseded keys
    pub const LEGACY_KEYS: &str = "legacy-keys";
    /// Secret store: integer key version
    pub const KEY_VERSION: &str = "key-version";
    /// Local store: whether cloud sync is enabled
    pub const SYNC_ENABLED: &str = "sync-enabled";
    /// Local store: ms timestamp of the last completed sync
    pub const LAST_SYNC: &str = "last-sync-timestamp";
    /// Local store: serialized pending operation queue
    pub const PENDING_OPERATIONS: &str = "pending-operations";
    /// Local store: serialized circuit breaker state (suffixed by scope)
    pub const CIRCUIT_BREAKER: &str = "circuit-breaker-state";
    /// Local store: record ids known to be undecryptable remotely
    pub const CORRUPTED_IGNORE_LIST: &str = "corrupted-ignore-list";
    /// Local store: record ids whose upload was skipped (remote already
    /// held a well-formed document)
    pub const SKIPPED_UPLOAD_IDS: &str = "skipped-upload-ids";
    /// Local store: prefix under which individual records are stored
    pub const RECORD_PREFIX: &str = "record:";
    /// Local store: prefix for per-record sync metadata
    pub const SYNC_META_PREFIX: &str = "sync-meta:";
    /// Local store: stable identifier of this device
    pub const DEVICE_ID: &str = "device-id";
}

/// A single measurement record. Records are immutable once created;
/// an update is modeled as delete + add.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Unique record id, generated at creation
    pub id: Uuid,
    /// Measured value
    pub value: f64,
    /// Measurement kind, e.g. "fasting"
    pub kind: String,
    /// Measurement time, milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Optional free-form notes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Input for creating a new measurement
#[derive(Debug, Clone)]
pub struct NewMeasurement {
    /// Measured value
    pub value: f64,
    /// Measurement kind
    pub kind: String,
    /// Measurement time, milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Optional free-form notes
    pub notes: Option<String>,
}

impl Measurement {
    /// Materialize a new record from input, assigning a fresh id
    pub fn from_input(input: NewMeasurement) -> Self {
        Self {
            id: Uuid::new_v4(),
            value: input.value,
            kind: input.kind,
            timestamp: input.timestamp,
            notes: input.notes,
        }
    }

    /// Key under which this record lives in the local store
    pub fn local_key(&self) -> String {
        record_local_key(&self.id)
    }
}

/// Local-store key for a record id
pub fn record_local_key(id: &Uuid) -> String {
    format!("{}{}", state_keys::RECORD_PREFIX, id)
}

/// A record's encrypted mirror in the remote document store.
///
/// All record fields live inside `envelope` except `plaintext_timestamp`,
/// which is deliberately left unencrypted to support range queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    /// Authenticated owner this document belongs to
    pub owner: String,
    /// Record id mirrored by this document
    pub record_id: Uuid,
    /// Versioned encrypted envelope string
    pub envelope: String,
    /// Measurement timestamp, duplicated outside the envelope (ms)
    pub plaintext_timestamp: i64,
    /// Last modification time of the document (ms)
    pub last_modified: i64,
    /// Whether a previous fetch flagged this document as undecryptable
    #[serde(default)]
    pub is_corrupted: bool,
}

impl RemoteDocument {
    /// Canonical remote document id: `{owner}_{recordId}`
    pub fn doc_id(owner: &str, record_id: &Uuid) -> String {
        format!("{}_{}", owner, record_id)
    }

    /// Id of this document
    pub fn id(&self) -> String {
        Self::doc_id(&self.owner, &self.record_id)
    }
}

/// A change notification pushed by the remote document store
#[derive(Debug, Clone)]
pub struct RemoteChange {
    /// Owner whose document set changed
    pub owner: String,
    /// Record id affected, when the store reports one
    pub record_id: Option<Uuid>,
}

/// Per-record sync bookkeeping. Used only for conflict and device
/// visibility diagnostics, never for ordering merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Record this metadata belongs to
    pub record_id: Uuid,
    /// Monotonic per-record version
    pub version: u32,
    /// Last time this record was confirmed in sync (ms)
    pub last_synced_at: i64,
    /// Device that performed the last sync
    pub device_id: String,
}

/// Current time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_from_input_assigns_id() {
        let a = Measurement::from_input(NewMeasurement {
            value: 120.0,
            kind: "fasting".to_string(),
            timestamp: 1_700_000_000_000,
            notes: None,
        });
        let b = Measurement::from_input(NewMeasurement {
            value: 120.0,
            kind: "fasting".to_string(),
            timestamp: 1_700_000_000_000,
            notes: None,
        });
        assert_ne!(a.id, b.id);
        assert_eq!(a.value, 120.0);
    }

    #[test]
    fn test_doc_id_format() {
        let id = Uuid::new_v4();
        let doc_id = RemoteDocument::doc_id("owner-1", &id);
        assert_eq!(doc_id, format!("owner-1_{}", id));
    }

    #[test]
    fn test_measurement_serde_skips_empty_notes() {
        let m = Measurement::from_input(NewMeasurement {
            value: 5.5,
            kind: "post-meal".to_string(),
            timestamp: 1,
            notes: None,
        });
        let json = serde_json::to_string(&m).unwrap();
        assert!(!json.contains("notes"));

        let restored: Measurement = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, m);
    }
}
