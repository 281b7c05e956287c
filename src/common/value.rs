//! Envelope of values stored in the Dht, either plain or self-signed.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::common::{Id, PublicKey, PUBLIC_KEY_SIZE};

/// Maximum size of an encoded value envelope.
pub const MAX_ENTRY_SIZE: usize = 170;

const SIGNATURE_SIZE: usize = 64;
const VERSION_SIZE: usize = 8;

const UNSIGNED: u8 = 0;
const SIGNED: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A decoded value envelope.
pub struct Value {
    payload: Bytes,
    public_key: Option<PublicKey>,
    version: u64,
}

impl Value {
    /// Encode an unsigned envelope: `0x00 ‖ payload`.
    pub fn unsigned(payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + payload.len());

        buf.put_u8(UNSIGNED);
        buf.put_slice(payload);

        buf.freeze()
    }

    /// Encode a signed envelope versioned with the current UNIX time in seconds.
    pub fn signed(payload: &[u8], signer: &SigningKey) -> Bytes {
        let version = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Self::signed_with_version(payload, signer, version)
    }

    /// Encode a signed envelope:
    /// `0x01 ‖ version(u64 BE) ‖ public_key(32) ‖ payload ‖ signature(64)`.
    pub fn signed_with_version(payload: &[u8], signer: &SigningKey, version: u64) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            1 + VERSION_SIZE + PUBLIC_KEY_SIZE + payload.len() + SIGNATURE_SIZE,
        );

        buf.put_u8(SIGNED);
        buf.put_u64(version);
        buf.put_slice(signer.verifying_key().as_bytes());
        buf.put_slice(payload);

        let signature = signer.sign(&buf);
        buf.put_slice(&signature.to_bytes());

        buf.freeze()
    }

    /// Decode and verify an envelope.
    pub fn decode(bytes: &[u8]) -> Result<Value, ValueError> {
        let (kind, rest) = bytes.split_first().ok_or(ValueError::Empty)?;

        match *kind {
            UNSIGNED => Ok(Value {
                payload: Bytes::copy_from_slice(rest),
                public_key: None,
                version: 0,
            }),
            SIGNED => {
                if rest.len() < VERSION_SIZE + PUBLIC_KEY_SIZE + SIGNATURE_SIZE {
                    return Err(ValueError::Truncated(bytes.len()));
                }

                let (signed, signature) = bytes.split_at(bytes.len() - SIGNATURE_SIZE);

                let mut version = [0_u8; VERSION_SIZE];
                version.copy_from_slice(&rest[..VERSION_SIZE]);

                let mut public_key = [0_u8; PUBLIC_KEY_SIZE];
                public_key.copy_from_slice(&rest[VERSION_SIZE..VERSION_SIZE + PUBLIC_KEY_SIZE]);

                let verifying_key = VerifyingKey::from_bytes(&public_key)
                    .map_err(|_| ValueError::InvalidPublicKey)?;
                let signature =
                    Signature::from_slice(signature).map_err(|_| ValueError::InvalidSignature)?;

                verifying_key
                    .verify(signed, &signature)
                    .map_err(|_| ValueError::InvalidSignature)?;

                Ok(Value {
                    payload: Bytes::copy_from_slice(&signed[1 + VERSION_SIZE + PUBLIC_KEY_SIZE..]),
                    public_key: Some(public_key),
                    version: u64::from_be_bytes(version),
                })
            }
            other => Err(ValueError::UnknownKind(other)),
        }
    }

    // === Getters ===

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Embedded public key of the signer, `None` for anonymous values.
    pub fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref()
    }

    /// Signer supplied version, always `0` for anonymous values.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Identity of the owner: the SHA-1 of the embedded public key.
    pub fn owner(&self) -> Option<Id> {
        self.public_key.as_ref().map(|key| Id::hash(key))
    }
}

/// Decode raw values, keeping only the highest version per signer.
///
/// Signed results come first, in the order their signer was first seen,
/// followed by every anonymous payload in input order. Values that fail
/// to decode or verify are skipped.
pub fn post_process_values(values: &[Bytes]) -> Vec<(Bytes, Option<PublicKey>)> {
    let mut signed: Vec<(PublicKey, u64, Bytes)> = Vec::new();
    let mut unsigned = Vec::new();

    for raw in values {
        let value = match Value::decode(raw) {
            Ok(value) => value,
            Err(error) => {
                tracing::trace!(?error, "Ignoring invalid value");
                continue;
            }
        };

        match value.public_key {
            Some(public_key) => {
                match signed.iter_mut().find(|(key, _, _)| *key == public_key) {
                    Some(entry) => {
                        if value.version > entry.1 {
                            entry.1 = value.version;
                            entry.2 = value.payload;
                        }
                    }
                    None => signed.push((public_key, value.version, value.payload)),
                }
            }
            None => unsigned.push(value.payload),
        }
    }

    signed
        .into_iter()
        .map(|(key, _, payload)| (payload, Some(key)))
        .chain(unsigned.into_iter().map(|payload| (payload, None)))
        .collect()
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
/// Reasons a value envelope is treated as absent.
pub enum ValueError {
    #[error("Empty value")]
    Empty,

    #[error("Unknown value kind {0}")]
    UnknownKind(u8),

    #[error("Signed value too short ({0} bytes)")]
    Truncated(usize),

    #[error("Invalid embedded public key")]
    InvalidPublicKey,

    #[error("Invalid signature")]
    InvalidSignature,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> SigningKey {
        SigningKey::from_bytes(&rand::random())
    }

    #[test]
    fn unsigned() {
        let encoded = Value::unsigned(b"hello");

        assert_eq!(&encoded[..], b"\x00hello");

        let value = Value::decode(&encoded).unwrap();

        assert_eq!(value.payload(), &Bytes::from_static(b"hello"));
        assert_eq!(value.public_key(), None);
        assert_eq!(value.owner(), None);
        assert_eq!(value.version(), 0);
    }

    #[test]
    fn signed() {
        let signer = signer();
        let encoded = Value::signed_with_version(b"hello", &signer, 42);

        assert_eq!(encoded.len(), 1 + 8 + 32 + 5 + 64);

        let value = Value::decode(&encoded).unwrap();

        assert_eq!(value.payload(), &Bytes::from_static(b"hello"));
        assert_eq!(value.public_key(), Some(signer.verifying_key().as_bytes()));
        assert_eq!(value.version(), 42);
        assert_eq!(
            value.owner(),
            Some(Id::hash(signer.verifying_key().as_bytes()))
        );
    }

    #[test]
    fn tampered_signed_value_is_rejected() {
        let signer = signer();
        let encoded = Value::signed_with_version(b"hello", &signer, 1);

        let mut tampered = encoded.to_vec();
        tampered[1 + 8 + 32] = b'j';

        assert_eq!(
            Value::decode(&tampered),
            Err(ValueError::InvalidSignature)
        );
    }

    #[test]
    fn malformed_values() {
        assert_eq!(Value::decode(&[]), Err(ValueError::Empty));
        assert_eq!(Value::decode(&[7, 1, 2]), Err(ValueError::UnknownKind(7)));
        assert_eq!(Value::decode(&[1, 0, 0]), Err(ValueError::Truncated(3)));
    }

    #[test]
    fn post_process_keeps_latest_version_per_owner() {
        let a = signer();

        let values = vec![
            Value::signed_with_version(b"v1", &a, 1),
            Value::signed_with_version(b"v2", &a, 2),
            Value::unsigned(b"x"),
        ];

        let result = post_process_values(&values);

        assert_eq!(
            result,
            vec![
                (
                    Bytes::from_static(b"v2"),
                    Some(*a.verifying_key().as_bytes())
                ),
                (Bytes::from_static(b"x"), None),
            ]
        );
    }

    #[test]
    fn post_process_order_does_not_matter_for_versions() {
        let a = signer();
        let b = signer();

        let values = vec![
            Value::signed_with_version(b"a5", &a, 5),
            Value::signed_with_version(b"b1", &b, 1),
            Value::signed_with_version(b"a3", &a, 3),
            Bytes::from_static(b"\x09garbage"),
        ];

        let result = post_process_values(&values);

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].0, Bytes::from_static(b"a5"));
        assert_eq!(result[1].0, Bytes::from_static(b"b1"));
    }
}
