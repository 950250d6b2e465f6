//! # Encrypted Envelope Format
//!
//! The versioned wire form of an encrypted record:
//!
//! ```text
//! v1|{12-hex key hash}|{32-hex iv}:{hex ciphertext}
//! ```
//!
//! Strings without a version prefix are parsed as the legacy
//! `{iv}:{ciphertext}` form with key-hash checking skipped. Unknown
//! version prefixes are rejected outright rather than silently falling
//! through to the cipher.

use crate::error::{Result, SyncError};

/// Length in bytes of the per-envelope IV
pub const IV_LEN: usize = 16;
/// Length in hex characters of the key fingerprint
pub const KEY_HASH_LEN: usize = 12;

const V1_PREFIX: &str = "v1|";

/// Parsed encrypted envelope
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Current versioned format carrying a key fingerprint.
    ///
    /// The fingerprint exists purely for diagnosing key mismatches; it is
    /// never used to select a decryption key.
    V1 {
        /// Short non-reversible fingerprint of the encrypting key
        key_hash: String,
        /// Per-envelope random IV
        iv: Vec<u8>,
        /// Ciphertext including the authentication tag
        ciphertext: Vec<u8>,
    },
    /// Unversioned format predating the v1 header
    Legacy {
        /// Per-envelope IV
        iv: Vec<u8>,
        /// Ciphertext including the authentication tag
        ciphertext: Vec<u8>,
    },
}

impl Envelope {
    /// Parse a wire string into an envelope
    pub fn parse(wire: &str) -> Result<Self> {
        if let Some(rest) = wire.strip_prefix(V1_PREFIX) {
            let (key_hash, body) = rest
                .split_once('|')
                .ok_or_else(|| SyncError::decryption("v1 envelope missing key hash segment"))?;
            if key_hash.len() != KEY_HASH_LEN || !is_hex(key_hash) {
                return Err(SyncError::decryption(format!(
                    "malformed key hash '{}' in v1 envelope",
                    key_hash
                )));
            }
            let (iv, ciphertext) = parse_body(body)?;
            return Ok(Self::V1 {
                key_hash: key_hash.to_string(),
                iv,
                ciphertext,
            });
        }

        // Any other explicit version tag is an unknown format, not legacy.
        if looks_versioned(wire) {
            return Err(SyncError::decryption(format!(
                "unknown envelope version '{}'",
                wire.split('|').next().unwrap_or("")
            )));
        }

        let (iv, ciphertext) = parse_body(wire)?;
        Ok(Self::Legacy { iv, ciphertext })
    }

    /// Render a v1 envelope to its wire form
    pub fn to_wire(key_hash: &str, iv: &[u8], ciphertext: &[u8]) -> String {
        format!(
            "v1|{}|{}:{}",
            key_hash,
            hex::encode(iv),
            hex::encode(ciphertext)
        )
    }

    /// IV of this envelope
    pub fn iv(&self) -> &[u8] {
        match self {
            Self::V1 { iv, .. } | Self::Legacy { iv, .. } => iv,
        }
    }

    /// Ciphertext of this envelope
    pub fn ciphertext(&self) -> &[u8] {
        match self {
            Self::V1 { ciphertext, .. } | Self::Legacy { ciphertext, .. } => ciphertext,
        }
    }

    /// Key fingerprint, when the format carries one
    pub fn key_hash(&self) -> Option<&str> {
        match self {
            Self::V1 { key_hash, .. } => Some(key_hash),
            Self::Legacy { .. } => None,
        }
    }
}

fn parse_body(body: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let (iv_hex, cipher_hex) = body
        .split_once(':')
        .ok_or_else(|| SyncError::decryption("envelope body missing iv:ciphertext delimiter"))?;
    let iv = hex::decode(iv_hex)
        .map_err(|e| SyncError::decryption(format!("invalid iv hex: {}", e)))?;
    if iv.len() != IV_LEN {
        return Err(SyncError::decryption(format!(
            "iv must be {} bytes, got {}",
            IV_LEN,
            iv.len()
        )));
    }
    let ciphertext = hex::decode(cipher_hex)
        .map_err(|e| SyncError::decryption(format!("invalid ciphertext hex: {}", e)))?;
    if ciphertext.is_empty() {
        return Err(SyncError::decryption("empty ciphertext"));
    }
    Ok((iv, ciphertext))
}

/// Whether the string starts with something that looks like a version
/// tag (`v` + digits + `|`)
fn looks_versioned(wire: &str) -> bool {
    let Some((head, _)) = wire.split_once('|') else {
        return false;
    };
    let mut chars = head.chars();
    chars.next() == Some('v') && chars.as_str().chars().all(|c| c.is_ascii_digit())
        && head.len() > 1
}

fn is_hex(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_hexdigit())
}
