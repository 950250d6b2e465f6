//! Key lifecycle scenarios across the public API: rotation with data
//! written under old keys, phrase backup and restore between devices,
//! and legacy-key cleanup after a migration pass.

use std::sync::Arc;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

use vitalsync::store::memory::{MemoryRemoteStore, MemorySecretStore};
use vitalsync::store::SecretStore;
use vitalsync::types::now_ms;
use vitalsync::{EncryptionService, Measurement, NewMeasurement, SyncConfig, SyncError};

fn service(secrets: &Arc<MemorySecretStore>) -> EncryptionService {
    EncryptionService::new(
        Arc::clone(secrets) as Arc<dyn SecretStore>,
        SyncConfig::for_tests(),
    )
}

fn record(value: f64) -> Measurement {
    Measurement::from_input(NewMeasurement {
        value,
        kind: "fasting".to_string(),
        timestamp: now_ms(),
        notes: None,
    })
}

#[tokio::test]
async fn rotation_keeps_a_history_of_readable_generations() {
    let secrets = Arc::new(MemorySecretStore::new());
    let crypto = service(&secrets);

    // One envelope per key generation.
    let mut wires = Vec::new();
    for generation in 0..4 {
        let r = record(100.0 + generation as f64);
        wires.push((r.clone(), crypto.encrypt(&r).await.unwrap()));
        crypto.rotate_key().await.unwrap();
    }

    assert_eq!(crypto.key_version().await.unwrap(), 5);
    assert_eq!(crypto.legacy_key_count().await.unwrap(), 4);

    // Every generation still decrypts, each via its own legacy slot
    // (newest first).
    for (age, (r, wire)) in wires.iter().rev().enumerate() {
        let outcome = crypto.decrypt(wire).await.unwrap();
        assert_eq!(&outcome.measurement, r);
        assert!(outcome.used_legacy_key);
        assert_eq!(outcome.legacy_index, Some(age));
    }
}

#[tokio::test]
async fn phrase_backup_restores_onto_a_fresh_device() {
    let remote = MemoryRemoteStore::new();

    // Device A: encrypt a record and back the key up.
    let secrets_a = Arc::new(MemorySecretStore::new());
    let crypto_a = service(&secrets_a);
    let r = record(108.0);
    let wire = crypto_a.encrypt(&r).await.unwrap();
    crypto_a
        .backup_key_with_phrase(&remote, "owner-1", "correct horse battery staple")
        .await
        .unwrap();
    let fingerprint_a = crypto_a.key_fingerprint().await.unwrap();

    // Device B: empty secret store, restore from the phrase.
    let secrets_b = Arc::new(MemorySecretStore::new());
    let crypto_b = service(&secrets_b);
    crypto_b
        .restore_key_from_phrase(&remote, "owner-1", "correct horse battery staple")
        .await
        .unwrap();

    assert_eq!(crypto_b.key_fingerprint().await.unwrap(), fingerprint_a);
    let outcome = crypto_b.decrypt(&wire).await.unwrap();
    assert_eq!(outcome.measurement, r);
    assert!(!outcome.used_legacy_key);
}

#[tokio::test]
async fn wrong_phrase_is_rejected_and_harmless() {
    let remote = MemoryRemoteStore::new();
    let secrets = Arc::new(MemorySecretStore::new());
    let crypto = service(&secrets);

    let r = record(99.0);
    let wire = crypto.encrypt(&r).await.unwrap();
    crypto
        .backup_key_with_phrase(&remote, "owner-1", "right phrase")
        .await
        .unwrap();

    let err = crypto
        .restore_key_from_phrase(&remote, "owner-1", "wrong phrase")
        .await
        .unwrap_err();
    assert_matches!(err, SyncError::InvalidPhrase { .. });

    // The failed restore changed nothing.
    let outcome = crypto.decrypt(&wire).await.unwrap();
    assert_eq!(outcome.measurement, r);
    assert!(!outcome.used_legacy_key);
    assert_eq!(crypto.key_version().await.unwrap(), 1);
}

#[tokio::test]
async fn restore_archives_the_interim_key() {
    let remote = MemoryRemoteStore::new();

    // The original device backs up its key.
    let secrets_a = Arc::new(MemorySecretStore::new());
    let crypto_a = service(&secrets_a);
    let original = record(70.0);
    let original_wire = crypto_a.encrypt(&original).await.unwrap();
    crypto_a
        .backup_key_with_phrase(&remote, "owner-1", "phrase")
        .await
        .unwrap();

    // A new device generates its own key and writes with it before the
    // user gets around to restoring.
    let secrets_b = Arc::new(MemorySecretStore::new());
    let crypto_b = service(&secrets_b);
    let interim = record(71.0);
    let interim_wire = crypto_b.encrypt(&interim).await.unwrap();

    crypto_b
        .restore_key_from_phrase(&remote, "owner-1", "phrase")
        .await
        .unwrap();

    // Both generations stay readable: the restored key directly, the
    // interim key via the legacy list.
    let outcome = crypto_b.decrypt(&original_wire).await.unwrap();
    assert_eq!(outcome.measurement, original);
    assert!(!outcome.used_legacy_key);

    let outcome = crypto_b.decrypt(&interim_wire).await.unwrap();
    assert_eq!(outcome.measurement, interim);
    assert!(outcome.used_legacy_key);
}

#[tokio::test]
async fn discarding_legacy_keys_cuts_off_old_envelopes() {
    let secrets = Arc::new(MemorySecretStore::new());
    let crypto = service(&secrets);

    let r = record(60.0);
    let old_wire = crypto.encrypt(&r).await.unwrap();
    crypto.rotate_key().await.unwrap();
    assert!(crypto.decrypt(&old_wire).await.is_ok());

    crypto.discard_legacy_keys().await.unwrap();
    assert_eq!(crypto.legacy_key_count().await.unwrap(), 0);

    let err = crypto.decrypt(&old_wire).await.unwrap_err();
    assert_matches!(err, SyncError::Decryption { .. });

    // The discard is persisted: a reloaded service cannot read it either.
    let reloaded = service(&secrets);
    assert!(reloaded.decrypt(&old_wire).await.is_err());
}

#[tokio::test]
async fn fingerprint_changes_with_rotation() {
    let secrets = Arc::new(MemorySecretStore::new());
    let crypto = service(&secrets);
    crypto.initialize_key(false).await.unwrap();

    let before = crypto.key_fingerprint().await.unwrap();
    crypto.rotate_key().await.unwrap();
    let after = crypto.key_fingerprint().await.unwrap();
    assert_ne!(before, after);
    assert_eq!(after.len(), 12);
}
