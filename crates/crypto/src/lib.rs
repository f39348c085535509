//! AES-256-GCM utilities shared by cairn crates.
//!
//! Two formats are produced:
//!
//! - **Sealed attributes**: binary blobs written to the session store by the
//!   encrypting codec. Layout:
//!   `version(1) | kid_len(1) | kid | nonce(12) | ciphertext || tag(16)`.
//! - **Configuration secrets**: text envelopes embedded in store configuration
//!   strings, `ENC[AES256-GCM,kid:<id>,data:<b64>,iv:<b64>,tag:<b64>]`. The
//!   `kid` field is optional.
//!
//! Decrypted secrets are returned as [`SecretString`] to prevent accidental
//! logging. The [`MasterKey`] wrapper zeroizes key material on drop.

use std::fmt;
use std::sync::LazyLock;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

// Re-export for consumers so they don't need a direct `secrecy` dependency.
pub use secrecy::{ExposeSecret, SecretString};

/// Current version byte of the sealed attribute layout.
const SEAL_VERSION: u8 = 1;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Compiled regex for parsing `ENC[AES256-GCM,...]` envelopes.
///
/// Captures four groups: kid (optional), data, iv, and tag.
static ENC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^ENC\[AES256-GCM,(?:kid:([A-Za-z0-9_-]+),)?data:([A-Za-z0-9+/=]+),iv:([A-Za-z0-9+/=]+),tag:([A-Za-z0-9+/=]+)\]$",
    )
    .expect("ENC regex is valid")
});

/// A 32-byte AES-256 key that is zeroized when dropped.
///
/// The [`Debug`] implementation is redacted. Raw bytes never leave this crate.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    /// Derive a key from an arbitrary passphrase with SHA-256.
    ///
    /// Used when sessions are configured with a free-form encryption key
    /// rather than raw key material.
    #[must_use]
    pub fn derive(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self(key)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(self.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(format!("invalid AES key: {e}")))
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Errors that can occur during encryption/decryption operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The provided master key is not valid (wrong length or encoding).
    #[error("invalid master key: {0}")]
    InvalidKey(String),

    /// The encrypted value format is malformed.
    #[error("invalid encrypted value: {0}")]
    InvalidFormat(String),

    /// Decryption failed: wrong key or corrupted data.
    #[error("decryption failed (wrong key or corrupted data)")]
    DecryptionFailed,

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
}

/// Parse a 32-byte master key from hex or base64.
///
/// Accepts either 64 hex characters or a base64 string that decodes to exactly
/// 32 bytes.
pub fn parse_master_key(raw: &str) -> Result<MasterKey, CryptoError> {
    let trimmed = raw.trim();
    if trimmed.len() == 64
        && let Ok(bytes) = hex::decode(trimmed)
        && bytes.len() == 32
    {
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        return Ok(MasterKey(key));
    }
    if let Ok(bytes) = B64.decode(trimmed)
        && bytes.len() == 32
    {
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        return Ok(MasterKey(key));
    }
    Err(CryptoError::InvalidKey(
        "must be 32 bytes encoded as 64 hex chars or base64".to_owned(),
    ))
}

/// Returns `true` if `value` looks like an `ENC[AES256-GCM,...]` envelope.
#[must_use]
pub fn is_encrypted(value: &str) -> bool {
    ENC_RE.is_match(value.trim())
}

/// Decrypt an `ENC[AES256-GCM,...]` configuration secret. Anything that is
/// not an envelope passes through unchanged.
pub fn decrypt_value(value: &str, master_key: &MasterKey) -> Result<SecretString, CryptoError> {
    let trimmed = value.trim();

    let Some(caps) = ENC_RE.captures(trimmed) else {
        return Ok(SecretString::new(value.to_owned()));
    };

    let data = decode_b64(&caps[2], "data")?;
    let iv = decode_b64(&caps[3], "iv")?;
    let tag = decode_b64(&caps[4], "tag")?;

    if iv.len() != NONCE_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "IV must be {NONCE_LEN} bytes, got {}",
            iv.len()
        )));
    }
    if tag.len() != TAG_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "tag must be {TAG_LEN} bytes, got {}",
            tag.len()
        )));
    }

    let mut ciphertext = data;
    ciphertext.extend_from_slice(&tag);

    let plaintext = master_key
        .cipher()?
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let s = String::from_utf8(plaintext)
        .map_err(|e| CryptoError::InvalidFormat(format!("decrypted value is not UTF-8: {e}")))?;

    Ok(SecretString::new(s))
}

/// Encrypt a configuration secret into an `ENC[AES256-GCM,...]` envelope,
/// optionally tagged with a key identifier.
pub fn encrypt_value(
    plaintext: &str,
    master_key: &MasterKey,
    kid: Option<&str>,
) -> Result<String, CryptoError> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = master_key
        .cipher()?
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let (data, tag) = ciphertext.split_at(ciphertext.len() - TAG_LEN);
    let kid_part = kid.map(|id| format!("kid:{id},")).unwrap_or_default();

    Ok(format!(
        "ENC[AES256-GCM,{kid_part}data:{},iv:{},tag:{}]",
        B64.encode(data),
        B64.encode(nonce.as_slice()),
        B64.encode(tag),
    ))
}

fn decode_b64(raw: &str, field: &str) -> Result<Vec<u8>, CryptoError> {
    B64.decode(raw)
        .map_err(|e| CryptoError::InvalidFormat(format!("invalid base64 in {field}: {e}")))
}

/// A named key entry for the [`AttributeCipher`].
pub struct CipherKey {
    /// Key identifier embedded in every sealed blob.
    pub kid: String,
    /// The AES-256 key material.
    pub key: MasterKey,
}

/// Seals and opens binary attribute payloads.
///
/// Supports multiple keys for rotation: the first key seals, every key is
/// eligible for opening (matched by the embedded `kid`, then tried in order).
pub struct AttributeCipher {
    keys: Vec<CipherKey>,
}

impl AttributeCipher {
    /// Create a cipher from a single key, assigned `kid="k0"`.
    pub fn new(key: MasterKey) -> Self {
        Self {
            keys: vec![CipherKey {
                kid: "k0".to_owned(),
                key,
            }],
        }
    }

    /// Create a cipher from several named keys. `keys[0]` seals.
    pub fn with_keys(keys: Vec<CipherKey>) -> Result<Self, CryptoError> {
        if keys.is_empty() {
            return Err(CryptoError::InvalidKey(
                "attribute cipher requires at least one key".to_owned(),
            ));
        }
        if let Some(bad) = keys.iter().find(|k| k.kid.is_empty() || k.kid.len() > 255) {
            return Err(CryptoError::InvalidKey(format!(
                "key id must be 1..=255 bytes, got {} bytes",
                bad.kid.len()
            )));
        }
        Ok(Self { keys })
    }

    /// Identifier of the key used for sealing.
    #[must_use]
    pub fn current_kid(&self) -> &str {
        &self.keys[0].kid
    }

    /// Encrypt `plaintext` with the current key.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let entry = &self.keys[0];
        let kid = entry.kid.as_bytes();
        let kid_len = u8::try_from(kid.len())
            .map_err(|_| CryptoError::EncryptionFailed("key id too long".to_owned()))?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = entry
            .key
            .cipher()?
            .encrypt(&nonce, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(2 + kid.len() + NONCE_LEN + ciphertext.len());
        out.push(SEAL_VERSION);
        out.push(kid_len);
        out.extend_from_slice(kid);
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a blob produced by [`seal`](Self::seal).
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (kid, nonce, ciphertext) = split_sealed(sealed)?;

        if let Some(entry) = self.keys.iter().find(|e| e.kid.as_bytes() == kid) {
            return open_with(&entry.key, nonce, ciphertext);
        }

        // Unknown kid: try every key before giving up.
        let mut last_err = CryptoError::DecryptionFailed;
        for entry in &self.keys {
            match open_with(&entry.key, nonce, ciphertext) {
                Ok(plain) => return Ok(plain),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

impl fmt::Debug for AttributeCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AttributeCipher([REDACTED])")
    }
}

fn split_sealed(sealed: &[u8]) -> Result<(&[u8], &[u8], &[u8]), CryptoError> {
    let [version, kid_len, rest @ ..] = sealed else {
        return Err(CryptoError::InvalidFormat("sealed value too short".to_owned()));
    };
    if *version != SEAL_VERSION {
        return Err(CryptoError::InvalidFormat(format!(
            "unsupported sealed version {version}"
        )));
    }
    let kid_len = usize::from(*kid_len);
    if rest.len() < kid_len + NONCE_LEN + TAG_LEN {
        return Err(CryptoError::InvalidFormat("sealed value truncated".to_owned()));
    }
    let (kid, rest) = rest.split_at(kid_len);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    Ok((kid, nonce, ciphertext))
}

fn open_with(key: &MasterKey, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    key.cipher()?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}
