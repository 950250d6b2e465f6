//! # Recovery-Phrase Key Backup
//!
//! Wraps the current symmetric key with a key derived from a user-supplied
//! recovery phrase (PBKDF2-HMAC-SHA256, slow by design) and stores the
//! wrapped key next to its salt in an owner-scoped document in the remote
//! store. Losing every device is then survivable as long as the phrase is
//! remembered; losing the phrase too is unrecoverable by design.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::info;

use crate::crypto::{EncryptionService, Key, KEY_LEN};
use crate::error::{Result, SyncError};
use crate::store::RemoteDocumentStore;
use crate::types::now_ms;

/// Remote collection holding one key-backup document per owner
pub const KEY_BACKUP_COLLECTION: &str = "key_backups";

const SALT_LEN: usize = 16;

type WrapCipher = AesGcm<Aes256, U16>;

/// Persisted form of a phrase-wrapped key backup
#[derive(Debug, Serialize, Deserialize)]
struct KeyBackupDocument {
    /// Hex-encoded random KDF salt
    salt: String,
    /// Hex-encoded IV used for the wrap
    iv: String,
    /// Hex-encoded wrapped key (ciphertext + tag)
    wrapped_key: String,
    /// PBKDF2 iteration count used at backup time
    iterations: u32,
    /// Version of the key that was backed up
    key_version: u32,
    /// Backup time (ms)
    updated_at: i64,
}

impl EncryptionService {
    /// Wrap the current key with a phrase-derived key and store the
    /// backup in the remote store under the owner's id
    pub async fn backup_key_with_phrase(
        &self,
        remote: &dyn RemoteDocumentStore,
        owner: &str,
        phrase: &str,
    ) -> Result<()> {
        let key = self.current_key_bytes().await?;
        let iterations = self.kdf_iterations();

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let wrapping_key = derive_wrapping_key(phrase, &salt, iterations);

        let mut iv = [0u8; 16];
        OsRng.fill_bytes(&mut iv);
        let cipher = WrapCipher::new(GenericArray::from_slice(&wrapping_key));
        let wrapped = cipher
            .encrypt(GenericArray::from_slice(&iv), key.as_slice())
            .map_err(|_| SyncError::key_missing("key wrap failed"))?;

        let doc = KeyBackupDocument {
            salt: hex::encode(salt),
            iv: hex::encode(iv),
            wrapped_key: hex::encode(wrapped),
            iterations,
            key_version: self.key_version().await?,
            updated_at: now_ms(),
        };

        remote
            .set_raw(KEY_BACKUP_COLLECTION, owner, &serde_json::to_value(&doc)?)
            .await?;
        info!(owner, "key backup stored");
        Ok(())
    }

    /// Fetch the owner's key backup and unwrap it with the phrase.
    /// On success the recovered key is installed as the current key (any
    /// interim key is archived to the legacy list). On failure local key
    /// state is untouched.
    pub async fn restore_key_from_phrase(
        &self,
        remote: &dyn RemoteDocumentStore,
        owner: &str,
        phrase: &str,
    ) -> Result<()> {
        let value = remote
            .get_raw(KEY_BACKUP_COLLECTION, owner)
            .await?
            .ok_or_else(|| SyncError::invalid_phrase("no key backup exists for this owner"))?;
        let doc: KeyBackupDocument = serde_json::from_value(value)
            .map_err(|e| SyncError::invalid_phrase(format!("malformed key backup: {}", e)))?;

        let salt = hex::decode(&doc.salt)
            .map_err(|e| SyncError::invalid_phrase(format!("malformed salt: {}", e)))?;
        let iv = hex::decode(&doc.iv)
            .map_err(|e| SyncError::invalid_phrase(format!("malformed iv: {}", e)))?;
        let wrapped = hex::decode(&doc.wrapped_key)
            .map_err(|e| SyncError::invalid_phrase(format!("malformed wrapped key: {}", e)))?;
        if iv.len() != 16 {
            return Err(SyncError::invalid_phrase("malformed iv length"));
        }

        let wrapping_key = derive_wrapping_key(phrase, &salt, doc.iterations);
        let cipher = WrapCipher::new(GenericArray::from_slice(&wrapping_key));
        let unwrapped = cipher
            .decrypt(GenericArray::from_slice(&iv), wrapped.as_slice())
            .map_err(|_| SyncError::invalid_phrase("phrase does not unwrap the backup key"))?;

        let key = Key::try_from(unwrapped.as_slice()).map_err(|_| {
            SyncError::invalid_phrase(format!(
                "unwrapped key has {} bytes, expected {}",
                unwrapped.len(),
                KEY_LEN
            ))
        })?;

        self.install_restored_key(key).await?;
        info!(owner, key_version = doc.key_version, "key restored from phrase");
        Ok(())
    }
}

fn derive_wrapping_key(phrase: &str, salt: &[u8], iterations: u32) -> Key {
    let mut out = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(phrase.as_bytes(), salt, iterations, &mut out);
    out
}
