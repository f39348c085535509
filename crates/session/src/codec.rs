//! Attribute value codecs.
//!
//! A codec turns an [`AttributeValue`] into the bytes written to the store and
//! back. [`JsonCodec`] is the plain variant; [`EncryptingCodec`] wraps any
//! other codec with AES-256-GCM so that attribute payloads are opaque at rest.

use std::fmt;
use std::sync::Arc;

use cairn_crypto::{AttributeCipher, CipherKey, MasterKey, parse_master_key};

use crate::config::SessionConfiguration;
use crate::data::AttributeValue;
use crate::error::SessionError;

/// Serializes attribute values to bytes and back.
pub trait SessionCodec: Send + Sync + fmt::Debug {
    /// Encode a value.
    fn encode(&self, value: &AttributeValue) -> Result<Vec<u8>, SessionError>;

    /// Decode bytes produced by [`encode`](Self::encode).
    fn decode(&self, bytes: &[u8]) -> Result<AttributeValue, SessionError>;
}

/// Plain JSON codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl SessionCodec for JsonCodec {
    fn encode(&self, value: &AttributeValue) -> Result<Vec<u8>, SessionError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<AttributeValue, SessionError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Codec that seals the output of an inner codec with AES-256-GCM.
pub struct EncryptingCodec<C = JsonCodec> {
    inner: C,
    cipher: AttributeCipher,
}

impl<C: SessionCodec> EncryptingCodec<C> {
    /// Wrap `inner` with the given cipher.
    pub fn new(inner: C, cipher: AttributeCipher) -> Self {
        Self { inner, cipher }
    }
}

impl<C> fmt::Debug for EncryptingCodec<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptingCodec([REDACTED])")
    }
}

impl<C: SessionCodec> SessionCodec for EncryptingCodec<C> {
    fn encode(&self, value: &AttributeValue) -> Result<Vec<u8>, SessionError> {
        let plain = self.inner.encode(value)?;
        Ok(self.cipher.seal(&plain)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<AttributeValue, SessionError> {
        let plain = self.cipher.open(bytes)?;
        self.inner.decode(&plain)
    }
}

/// Build the codec selected by `config`: encrypting when an
/// `encryption_key` is present, plain JSON otherwise.
///
/// The current key seals new values; retired keys only open values written
/// before the rotation.
pub fn codec_for(config: &SessionConfiguration) -> Result<Arc<dyn SessionCodec>, SessionError> {
    let Some(raw) = config.encryption_key.as_deref() else {
        return Ok(Arc::new(JsonCodec));
    };
    let mut keys = vec![CipherKey {
        kid: config.encryption_key_id.clone(),
        key: key_material(raw),
    }];
    keys.extend(config.retired_encryption_keys.iter().map(|retired| CipherKey {
        kid: retired.id.clone(),
        key: key_material(&retired.key),
    }));
    Ok(Arc::new(EncryptingCodec::new(
        JsonCodec,
        AttributeCipher::with_keys(keys)?,
    )))
}

/// Raw key material wins; anything else is treated as a passphrase.
fn key_material(raw: &str) -> MasterKey {
    parse_master_key(raw).unwrap_or_else(|_| MasterKey::derive(raw))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::RetiredKey;

    fn sample() -> AttributeValue {
        json!({"user": "alice", "roles": ["admin", "ops"], "visits": 3, "premium": true})
    }

    #[test]
    fn json_roundtrip() {
        let codec = JsonCodec;
        let bytes = codec.encode(&sample()).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn json_decode_garbage_is_serialization_error() {
        let err = JsonCodec.decode(b"{not json").unwrap_err();
        assert!(matches!(err, SessionError::Serialization(_)));
    }

    #[test]
    fn encrypting_roundtrip_hides_plaintext() {
        let codec = EncryptingCodec::new(JsonCodec, AttributeCipher::new(MasterKey::derive("k")));
        let bytes = codec.encode(&sample()).unwrap();
        assert!(!bytes.windows(5).any(|w| w == b"alice"));
        assert_eq!(codec.decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn encrypting_decode_with_wrong_key_fails() {
        let a = EncryptingCodec::new(JsonCodec, AttributeCipher::new(MasterKey::derive("a")));
        let b = EncryptingCodec::new(JsonCodec, AttributeCipher::new(MasterKey::derive("b")));
        let bytes = a.encode(&json!("secret")).unwrap();
        assert!(matches!(b.decode(&bytes), Err(SessionError::Crypto(_))));
    }

    #[test]
    fn codec_selection_follows_configuration() {
        let plain = codec_for(&SessionConfiguration::default()).unwrap();
        assert_eq!(format!("{plain:?}"), "JsonCodec");

        let cfg = SessionConfiguration {
            encryption_key: Some("passphrase".into()),
            ..SessionConfiguration::default()
        };
        let encrypting = codec_for(&cfg).unwrap();
        assert_eq!(format!("{encrypting:?}"), "EncryptingCodec([REDACTED])");
        let bytes = encrypting.encode(&json!(1)).unwrap();
        assert_eq!(encrypting.decode(&bytes).unwrap(), json!(1));
    }

    #[test]
    fn rotated_codec_reads_values_sealed_with_the_retired_key() {
        let before = SessionConfiguration {
            encryption_key: Some("first".into()),
            encryption_key_id: "2023".into(),
            ..SessionConfiguration::default()
        };
        let after = SessionConfiguration {
            encryption_key: Some("second".into()),
            encryption_key_id: "2024".into(),
            retired_encryption_keys: vec![RetiredKey {
                id: "2023".into(),
                key: "first".into(),
            }],
            ..SessionConfiguration::default()
        };
        let old_bytes = codec_for(&before).unwrap().encode(&sample()).unwrap();

        let rotated = codec_for(&after).unwrap();
        assert_eq!(rotated.decode(&old_bytes).unwrap(), sample());

        let new_bytes = rotated.encode(&sample()).unwrap();
        assert!(matches!(
            codec_for(&before).unwrap().decode(&new_bytes),
            Err(SessionError::Crypto(_))
        ));
    }
}
