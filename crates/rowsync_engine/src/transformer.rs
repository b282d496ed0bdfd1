//! Cloud transformer: record encryption and integrity.
//!
//! The symmetric transformer seals the canonical field encoding with
//! AES-256-GCM (random nonce prepended) and computes a detached
//! HMAC-SHA256 tag over `(key, modified, key_version, payload)`.
//! Tombstones have no payload, so the detached tag is what keeps their
//! key and timestamp authenticated.

use rowsync_protocol::{
    decode_fields, encode_fields, wire::WireWriter, CloudData, LocalData, ObjectKey,
};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// Size of a sync key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Transformer failures.
#[derive(Error, Debug)]
pub enum TransformError {
    /// The integrity tag did not verify; the record must be treated as
    /// Corrupted.
    #[error("integrity tag mismatch for {key}")]
    TagMismatch {
        /// The offending record.
        key: ObjectKey,
    },

    /// Encryption or decryption failed.
    #[error("cipher failure: {0}")]
    Cipher(String),

    /// The payload did not parse after decryption.
    #[error(transparent)]
    Payload(#[from] rowsync_protocol::ProtocolError),

    /// No key material for the record's key version.
    #[error("no key for version {0}")]
    UnknownKeyVersion(u32),

    /// Key material has the wrong size.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Required size.
        expected: usize,
        /// Provided size.
        actual: usize,
    },
}

/// Symmetric key material, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SyncKey {
    bytes: [u8; KEY_SIZE],
}

impl SyncKey {
    /// Generates a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransformError> {
        if bytes.len() != KEY_SIZE {
            return Err(TransformError::InvalidKeySize {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    /// Derives a key from a passphrase with HKDF-SHA256.
    ///
    /// The salt must be random, stored with the database, and reused on
    /// every derivation.
    pub fn derive_from_passphrase(passphrase: &[u8], salt: &[u8]) -> Result<Self, TransformError> {
        use hkdf::Hkdf;
        let hk = Hkdf::<Sha256>::new(Some(salt), passphrase);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(b"rowsync-record-key-v1", &mut bytes)
            .map_err(|_| TransformError::Cipher("HKDF expand failed".into()))?;
        Ok(Self { bytes })
    }

    /// The raw key bytes. Do not log or persist the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for SyncKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Supplies key material by version, so records sealed under rotated-out
/// keys stay decryptable.
pub trait KeyProvider {
    /// Version new uploads are sealed under.
    fn current_version(&self) -> u32;

    /// Key material for a given version.
    fn key(&self, version: u32) -> Result<SyncKey, TransformError>;
}

/// A key provider holding explicit versions in memory.
#[derive(Debug)]
pub struct StaticKeyProvider {
    keys: Vec<(u32, SyncKey)>,
    current: u32,
}

impl StaticKeyProvider {
    /// Creates a provider with one key at version 1.
    pub fn new(key: SyncKey) -> Self {
        Self {
            keys: vec![(1, key)],
            current: 1,
        }
    }

    /// Adds a key version and makes it current.
    pub fn add_version(&mut self, version: u32, key: SyncKey) {
        self.keys.retain(|(v, _)| *v != version);
        self.keys.push((version, key));
        self.current = self.current.max(version);
    }
}

impl KeyProvider for StaticKeyProvider {
    fn current_version(&self) -> u32 {
        self.current
    }

    fn key(&self, version: u32) -> Result<SyncKey, TransformError> {
        self.keys
            .iter()
            .find(|(v, _)| *v == version)
            .map(|(_, k)| k.clone())
            .ok_or(TransformError::UnknownKeyVersion(version))
    }
}

/// Mediates between in-clear local rows and opaque cloud payloads.
pub trait CloudTransformer {
    /// Seals a local record for the cloud.
    fn transform_upload(&self, data: &LocalData) -> Result<CloudData, TransformError>;

    /// Opens a cloud record into a local one. Fails with
    /// [`TransformError::TagMismatch`] when the integrity tag does not
    /// verify; the caller marks the key Corrupted.
    fn transform_download(&self, data: &CloudData) -> Result<LocalData, TransformError>;
}

/// What the integrity tag covers. `payload` is the ciphertext (or absent
/// for tombstones), so the tag can be verified before touching the
/// cipher.
fn tag_input(key: &ObjectKey, modified: &rowsync_protocol::Timestamp, version: u32, payload: Option<&[u8]>) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.write_str(&key.type_name);
    w.write_str(&key.id);
    w.write_str(&modified.to_iso());
    w.write_u32(version);
    w.write_opt_bytes(payload);
    w.into_bytes()
}

fn compute_tag(key: &SyncKey, input: &[u8]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes()).expect("HMAC accepts any key size");
    mac.update(input);
    mac.finalize().into_bytes().to_vec()
}

fn verify_tag(key: &SyncKey, input: &[u8], tag: &[u8]) -> bool {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes()).expect("HMAC accepts any key size");
    mac.update(input);
    mac.verify_slice(tag).is_ok()
}

/// The default transformer: AES-256-GCM payloads with detached HMAC tags.
pub struct SymmetricCloudTransformer<P: KeyProvider> {
    provider: P,
}

impl<P: KeyProvider> SymmetricCloudTransformer<P> {
    /// Creates a transformer over the given key provider.
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

impl<P: KeyProvider> CloudTransformer for SymmetricCloudTransformer<P> {
    fn transform_upload(&self, data: &LocalData) -> Result<CloudData, TransformError> {
        let version = self.provider.current_version();
        let key = self.provider.key(version)?;

        let payload = match &data.data {
            None => None,
            Some(fields) => {
                let plaintext = encode_fields(fields);
                let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
                    .map_err(|e| TransformError::Cipher(e.to_string()))?;
                let mut nonce_bytes = [0u8; NONCE_SIZE];
                rand::thread_rng().fill_bytes(&mut nonce_bytes);
                let nonce = Nonce::from_slice(&nonce_bytes);
                let ciphertext = cipher
                    .encrypt(nonce, plaintext.as_slice())
                    .map_err(|_| TransformError::Cipher("encryption error".into()))?;
                let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
                sealed.extend_from_slice(&nonce_bytes);
                sealed.extend(ciphertext);
                Some(sealed)
            }
        };

        let input = tag_input(&data.key, &data.modified, version, payload.as_deref());
        let tag = compute_tag(&key, &input);

        Ok(CloudData {
            key: data.key.clone(),
            modified: data.modified,
            key_version: version,
            payload,
            tag,
        })
    }

    fn transform_download(&self, data: &CloudData) -> Result<LocalData, TransformError> {
        let key = self.provider.key(data.key_version)?;

        let input = tag_input(&data.key, &data.modified, data.key_version, data.payload.as_deref());
        if !verify_tag(&key, &input, &data.tag) {
            return Err(TransformError::TagMismatch {
                key: data.key.clone(),
            });
        }

        let fields = match &data.payload {
            None => None,
            Some(sealed) => {
                if sealed.len() < NONCE_SIZE {
                    return Err(TransformError::Cipher("payload too short".into()));
                }
                let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
                    .map_err(|e| TransformError::Cipher(e.to_string()))?;
                let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
                let plaintext = cipher
                    .decrypt(nonce, &sealed[NONCE_SIZE..])
                    .map_err(|_| TransformError::Cipher("decryption error".into()))?;
                Some(decode_fields(&plaintext)?)
            }
        };

        Ok(LocalData {
            key: data.key.clone(),
            modified: data.modified,
            data: fields,
        })
    }
}

/// An identity transformer: payloads travel in the clear but still carry
/// an integrity tag, so corruption remains detectable. For tests and
/// deployments that terminate encryption elsewhere.
pub struct PlainCloudTransformer {
    key: SyncKey,
}

impl PlainCloudTransformer {
    /// Creates a plain transformer with a fixed tagging key.
    pub fn new() -> Self {
        Self {
            key: SyncKey { bytes: [0u8; KEY_SIZE] },
        }
    }
}

impl Default for PlainCloudTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudTransformer for PlainCloudTransformer {
    fn transform_upload(&self, data: &LocalData) -> Result<CloudData, TransformError> {
        let payload = data.data.as_ref().map(encode_fields);
        let input = tag_input(&data.key, &data.modified, 0, payload.as_deref());
        Ok(CloudData {
            key: data.key.clone(),
            modified: data.modified,
            key_version: 0,
            payload,
            tag: compute_tag(&self.key, &input),
        })
    }

    fn transform_download(&self, data: &CloudData) -> Result<LocalData, TransformError> {
        let input = tag_input(&data.key, &data.modified, data.key_version, data.payload.as_deref());
        if !verify_tag(&self.key, &input, &data.tag) {
            return Err(TransformError::TagMismatch {
                key: data.key.clone(),
            });
        }
        let fields = match &data.payload {
            None => None,
            Some(bytes) => Some(decode_fields(bytes)?),
        };
        Ok(LocalData {
            key: data.key.clone(),
            modified: data.modified,
            data: fields,
        })
    }
}
