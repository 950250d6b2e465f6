//! # Encryption Service
//!
//! Owns the current symmetric key, its version, and a bounded list of
//! superseded ("legacy") keys; produces and consumes versioned encrypted
//! envelopes.
//!
//! ## Key Lifecycle
//!
//! The key material is generated on first use and persisted in the
//! secret store. Rotation archives the outgoing current key at the front
//! of the legacy list (FIFO, capped) before installing a fresh key, so a
//! rotation never orphans previously-encrypted remote records: decryption
//! falls back through the legacy keys in order, and the sync engine
//! re-encrypts on read to progressively migrate data forward.

pub mod envelope;
pub mod phrase;

use std::sync::Arc;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::store::SecretStore;
use crate::types::{state_keys, Measurement};

use self::envelope::{Envelope, IV_LEN, KEY_HASH_LEN};

/// AES-256-GCM with a 16-byte IV, matching the 32-hex-char envelope field
type EnvelopeCipher = AesGcm<Aes256, U16>;

/// Length in bytes of a symmetric key
pub const KEY_LEN: usize = 32;

/// One symmetric key
pub type Key = [u8; KEY_LEN];

/// In-memory key material
#[derive(Debug, Clone)]
struct KeyMaterial {
    current: Key,
    version: u32,
    /// Superseded keys, newest first, bounded FIFO
    legacy: Vec<Key>,
}

/// Result of a successful decryption
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptOutcome {
    /// The recovered record
    pub measurement: Measurement,
    /// Whether a legacy key (not the current key) was used
    pub used_legacy_key: bool,
    /// Index into the legacy list of the key that succeeded
    pub legacy_index: Option<usize>,
}

/// Encryption service with an explicit lifecycle: construct with injected
/// collaborators, call [`initialize_key`](Self::initialize_key) before
/// first use (the sync engine does this lazily).
pub struct EncryptionService {
    secrets: Arc<dyn SecretStore>,
    config: SyncConfig,
    keys: RwLock<Option<KeyMaterial>>,
    /// Serializes initialization so concurrent first-use callers cannot
    /// generate duplicate keys
    init_guard: Mutex<()>,
}

impl EncryptionService {
    /// Create a service bound to a secret store
    pub fn new(secrets: Arc<dyn SecretStore>, config: SyncConfig) -> Self {
        Self {
            secrets,
            config,
            keys: RwLock::new(None),
            init_guard: Mutex::new(()),
        }
    }

    /// Load the current key from the secret store, generating and
    /// persisting one if absent. With `force_new`, the existing key is
    /// archived to the legacy list and a fresh key installed.
    ///
    /// Idempotent under concurrent callers: only one initialization is
    /// ever in flight.
    pub async fn initialize_key(&self, force_new: bool) -> Result<()> {
        let _guard = self.init_guard.lock().await;

        if !force_new && self.keys.read().await.is_some() {
            return Ok(());
        }

        let loaded = self.load_from_store().await?;
        let material = match (loaded, force_new) {
            (Some(existing), false) => existing,
            (Some(existing), true) => {
                info!(
                    version = existing.version,
                    "archiving current key and installing a fresh one"
                );
                self.archived(existing)
            }
            (None, _) => {
                info!("no key material found, generating initial key");
                KeyMaterial {
                    current: generate_key(),
                    version: 1,
                    legacy: Vec::new(),
                }
            }
        };

        self.persist(&material).await?;
        *self.keys.write().await = Some(material);
        Ok(())
    }

    /// Archive the current key to the legacy list, generate a new current
    /// key, and bump the version
    pub async fn rotate_key(&self) -> Result<()> {
        self.initialize_key(true).await
    }

    /// Encrypt a record with the current key, using a fresh random IV
    pub async fn encrypt(&self, measurement: &Measurement) -> Result<String> {
        let material = self.material().await?;
        let plaintext = serde_json::to_vec(measurement)?;

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let cipher = EnvelopeCipher::new(GenericArray::from_slice(&material.current));
        let ciphertext = cipher
            .encrypt(GenericArray::from_slice(&iv), plaintext.as_slice())
            .map_err(|_| SyncError::decryption("encryption failed"))?;

        Ok(Envelope::to_wire(
            &fingerprint(&material.current),
            &iv,
            &ciphertext,
        ))
    }

    /// Decrypt an envelope. The current key is tried first; on failure,
    /// and only on failure, each legacy key is tried in order. A key is
    /// accepted only if the cipher succeeds and the plaintext is a valid
    /// record.
    pub async fn decrypt(&self, wire: &str) -> Result<DecryptOutcome> {
        let material = self.material().await?;
        let envelope = Envelope::parse(wire)?;

        if let Some(hash) = envelope.key_hash() {
            let current_hash = fingerprint(&material.current);
            if hash != current_hash {
                // Diagnostic only; the hash never selects a key.
                debug!(
                    envelope_hash = hash,
                    current_hash = %current_hash,
                    "envelope was encrypted under a different key"
                );
            }
        }

        if let Some(measurement) = try_key(&material.current, &envelope) {
            return Ok(DecryptOutcome {
                measurement,
                used_legacy_key: false,
                legacy_index: None,
            });
        }

        for (index, key) in material.legacy.iter().enumerate() {
            if let Some(measurement) = try_key(key, &envelope) {
                debug!(legacy_index = index, "decrypted with legacy key");
                return Ok(DecryptOutcome {
                    measurement,
                    used_legacy_key: true,
                    legacy_index: Some(index),
                });
            }
        }

        Err(SyncError::decryption(format!(
            "no key decrypts envelope (tried current + {} legacy)",
            material.legacy.len()
        )))
    }

    /// Whether key material is loaded
    pub async fn has_key(&self) -> bool {
        self.keys.read().await.is_some()
    }

    /// Version of the current key
    pub async fn key_version(&self) -> Result<u32> {
        Ok(self.material().await?.version)
    }

    /// Number of retained legacy keys
    pub async fn legacy_key_count(&self) -> Result<usize> {
        Ok(self.material().await?.legacy.len())
    }

    /// 12-hex fingerprint of the current key, for diagnostics
    pub async fn key_fingerprint(&self) -> Result<String> {
        Ok(fingerprint(&self.material().await?.current))
    }

    /// Drop all legacy keys, keeping only the current key. Used by repair
    /// tooling after a completed migration pass.
    pub async fn discard_legacy_keys(&self) -> Result<()> {
        let mut material = self.material().await?;
        let dropped = material.legacy.len();
        material.legacy.clear();
        self.persist(&material).await?;
        *self.keys.write().await = Some(material);
        if dropped > 0 {
            info!(dropped, "discarded legacy keys");
        }
        Ok(())
    }

    /// Raw current key bytes, for phrase wrapping
    pub(crate) async fn current_key_bytes(&self) -> Result<Key> {
        Ok(self.material().await?.current)
    }

    /// KDF iteration count from configuration
    pub(crate) fn kdf_iterations(&self) -> u32 {
        self.config.phrase_kdf_iterations
    }

    /// Install a key recovered from a phrase backup. The previous current
    /// key (if any, and if different) is archived so records written in
    /// the interim stay readable.
    pub(crate) async fn install_restored_key(&self, key: Key) -> Result<()> {
        let _guard = self.init_guard.lock().await;

        let material = match self.load_from_store().await? {
            Some(existing) if existing.current == key => existing,
            Some(existing) => {
                let mut archived = self.archived(existing);
                archived.current = key;
                warn!(
                    version = archived.version,
                    "installed restored key, previous key archived"
                );
                archived
            }
            None => KeyMaterial {
                current: key,
                version: 1,
                legacy: Vec::new(),
            },
        };

        self.persist(&material).await?;
        *self.keys.write().await = Some(material);
        Ok(())
    }

    /// Snapshot of the loaded key material, initializing lazily
    async fn material(&self) -> Result<KeyMaterial> {
        if let Some(material) = self.keys.read().await.clone() {
            return Ok(material);
        }
        self.initialize_key(false).await?;
        self.keys
            .read()
            .await
            .clone()
            .ok_or_else(|| SyncError::key_missing("key initialization produced no material"))
    }

    /// Push `current` to the front of the legacy list (evicting past the
    /// cap), install a fresh key, bump the version
    fn archived(&self, mut material: KeyMaterial) -> KeyMaterial {
        material.legacy.insert(0, material.current);
        material.legacy.truncate(self.config.max_legacy_keys);
        material.current = generate_key();
        material.version += 1;
        material
    }

    async fn load_from_store(&self) -> Result<Option<KeyMaterial>> {
        let Some(current_hex) = self.secrets.get_secret(state_keys::CURRENT_KEY).await? else {
            return Ok(None);
        };
        let current = decode_key(&current_hex)?;

        let version = match self.secrets.get_secret(state_keys::KEY_VERSION).await? {
            Some(v) => v.parse::<u32>().unwrap_or(1),
            None => 1,
        };

        let legacy = match self.secrets.get_secret(state_keys::LEGACY_KEYS).await? {
            Some(json) => {
                let hexes: Vec<String> = serde_json::from_str(&json)?;
                let mut keys = Vec::with_capacity(hexes.len());
                for h in &hexes {
                    match decode_key(h) {
                        Ok(k) => keys.push(k),
                        // A single damaged legacy entry should not take
                        // down the whole key set.
                        Err(e) => warn!("skipping undecodable legacy key: {}", e),
                    }
                }
                keys
            }
            None => Vec::new(),
        };

        Ok(Some(KeyMaterial {
            current,
            version,
            legacy,
        }))
    }

    async fn persist(&self, material: &KeyMaterial) -> Result<()> {
        self.secrets
            .set_secret(state_keys::CURRENT_KEY, &hex::encode(material.current))
            .await?;
        self.secrets
            .set_secret(state_keys::KEY_VERSION, &material.version.to_string())
            .await?;
        let legacy_hexes: Vec<String> = material.legacy.iter().map(hex::encode).collect();
        self.secrets
            .set_secret(
                state_keys::LEGACY_KEYS,
                &serde_json::to_string(&legacy_hexes)?,
            )
            .await?;
        Ok(())
    }
}

/// Attempt one key against an envelope; `None` unless the cipher
/// succeeds and the plaintext parses as a record
fn try_key(key: &Key, envelope: &Envelope) -> Option<Measurement> {
    let cipher = EnvelopeCipher::new(GenericArray::from_slice(key));
    let plaintext = cipher
        .decrypt(
            GenericArray::from_slice(envelope.iv()),
            envelope.ciphertext(),
        )
        .ok()?;
    serde_json::from_slice(&plaintext).ok()
}

/// Generate a fresh random key
fn generate_key() -> Key {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Short non-reversible fingerprint of a key (12 hex chars)
pub(crate) fn fingerprint(key: &Key) -> String {
    let digest = Sha256::digest(key);
    hex::encode(&digest[..KEY_HASH_LEN / 2])
}

fn decode_key(key_hex: &str) -> Result<Key> {
    let bytes = hex::decode(key_hex)
        .map_err(|e| SyncError::key_missing(format!("stored key is not hex: {}", e)))?;
    Key::try_from(bytes.as_slice())
        .map_err(|_| SyncError::key_missing(format!("stored key has {} bytes", bytes.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemorySecretStore;
    use crate::types::NewMeasurement;
    use assert_matches::assert_matches;

    fn service() -> EncryptionService {
        EncryptionService::new(Arc::new(MemorySecretStore::new()), SyncConfig::for_tests())
    }

    fn measurement() -> Measurement {
        Measurement::from_input(NewMeasurement {
            value: 98.5,
            kind: "fasting".to_string(),
            timestamp: 1_700_000_000_000,
            notes: Some("before breakfast".to_string()),
        })
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_round_trip() {
        let service = service();
        let record = measurement();

        let wire = service.encrypt(&record).await.unwrap();
        let outcome = service.decrypt(&wire).await.unwrap();

        assert_eq!(outcome.measurement, record);
        assert!(!outcome.used_legacy_key);
        assert_eq!(outcome.legacy_index, None);
    }

    #[tokio::test]
    async fn test_fresh_iv_per_call() {
        let service = service();
        let record = measurement();
        let a = service.encrypt(&record).await.unwrap();
        let b = service.encrypt(&record).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_legacy_fallback_after_rotation() {
        let service = service();
        let record = measurement();

        let old_wire = service.encrypt(&record).await.unwrap();
        service.rotate_key().await.unwrap();

        let outcome = service.decrypt(&old_wire).await.unwrap();
        assert_eq!(outcome.measurement, record);
        assert!(outcome.used_legacy_key);
        assert_eq!(outcome.legacy_index, Some(0));

        // New envelopes use the current key.
        let new_wire = service.encrypt(&record).await.unwrap();
        let outcome = service.decrypt(&new_wire).await.unwrap();
        assert!(!outcome.used_legacy_key);
    }

    #[tokio::test]
    async fn test_legacy_list_is_bounded_fifo() {
        let service = service();
        service.initialize_key(false).await.unwrap();

        for _ in 0..8 {
            service.rotate_key().await.unwrap();
        }

        assert_eq!(service.legacy_key_count().await.unwrap(), 5);
        assert_eq!(service.key_version().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_oldest_key_eventually_evicted() {
        let service = service();
        let record = measurement();
        let wire = service.encrypt(&record).await.unwrap();

        // After more rotations than the cap, the original key is gone.
        for _ in 0..6 {
            service.rotate_key().await.unwrap();
        }

        let err = service.decrypt(&wire).await.unwrap_err();
        assert_matches!(err, SyncError::Decryption { .. });
    }

    #[tokio::test]
    async fn test_key_persists_across_instances() {
        let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        let record = measurement();

        let first = EncryptionService::new(Arc::clone(&secrets), SyncConfig::for_tests());
        let wire = first.encrypt(&record).await.unwrap();

        let second = EncryptionService::new(secrets, SyncConfig::for_tests());
        let outcome = second.decrypt(&wire).await.unwrap();
        assert_eq!(outcome.measurement, record);
        assert!(!outcome.used_legacy_key);
    }

    #[tokio::test]
    async fn test_concurrent_initialization_single_key() {
        let service = Arc::new(service());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let svc = Arc::clone(&service);
            handles.push(tokio::spawn(
                async move { svc.initialize_key(false).await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(service.key_version().await.unwrap(), 1);
        assert_eq!(service.legacy_key_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_rejected() {
        let service = service();
        let wire = service.encrypt(&measurement()).await.unwrap();

        // Flip the last ciphertext nibble.
        let mut tampered = wire.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == '0' { '1' } else { '0' });

        assert!(service.decrypt(&tampered).await.is_err());
    }

    #[tokio::test]
    async fn test_fingerprint_shape() {
        let service = service();
        service.initialize_key(false).await.unwrap();
        let fp = service.key_fingerprint().await.unwrap();
        assert_eq!(fp.len(), KEY_HASH_LEN);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
