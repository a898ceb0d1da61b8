//! AES-256-GCM encryption service with a persisted, self-protected master key.
//!
//! The master key is generated on first use and stored inside the storage
//! backend under [`KEY_STORAGE_KEY`], wrapped by a root key derived from the
//! application-provided secret via PBKDF2-HMAC-SHA256 with a persisted random
//! salt. The on-disk layout carries a version byte so the wrapping can evolve.
//!
//! Every encryption uses a fresh random 96-bit IV; the entry key is passed as
//! associated data so ciphertext cannot be replayed under a different key.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::info;

use crate::error::SdkError;
use crate::storage::backend::StorageBackend;

/// Reserved backend key holding the wrapped master key.
pub const KEY_STORAGE_KEY: &str = "_auth_encryption_key";

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const SALT_SIZE: usize = 16;
const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_LAYOUT_VERSION: u8 = 1;

/// Serialized ciphertext envelope: `{alg, iv, tag, ct, v}`, all binary fields
/// base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherEnvelope {
    pub alg: String,
    pub iv: String,
    pub tag: String,
    pub ct: String,
    pub v: u8,
}

/// On-disk layout of the wrapped master key.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedKey {
    v: u8,
    salt: String,
    key: CipherEnvelope,
}

/// Symmetric encryption service. Owns the master key for the process lifetime.
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionService").finish_non_exhaustive()
    }
}

impl EncryptionService {
    /// Loads the master key from `backend`, creating and persisting it on
    /// first use.
    ///
    /// # Errors
    ///
    /// - [`SdkError::EncryptionUnavailable`] when `secret` is empty.
    /// - [`SdkError::Encryption`] when an existing key cannot be unwrapped
    ///   (wrong secret or unsupported layout version).
    pub async fn init(secret: &str, backend: &dyn StorageBackend) -> Result<Self, SdkError> {
        if secret.is_empty() {
            return Err(SdkError::EncryptionUnavailable {
                reason: "no encryption secret configured".to_string(),
            });
        }

        match backend.get(KEY_STORAGE_KEY).await? {
            Some(raw) => Self::unwrap_existing(secret, &raw),
            None => Self::create_and_persist(secret, backend).await,
        }
    }

    fn unwrap_existing(secret: &str, raw: &[u8]) -> Result<Self, SdkError> {
        let persisted: PersistedKey =
            serde_json::from_slice(raw).map_err(|err| SdkError::Encryption {
                message: format!("unreadable key record: {err}"),
            })?;
        if persisted.v != KEY_LAYOUT_VERSION {
            return Err(SdkError::Encryption {
                message: format!("unsupported key layout version {}", persisted.v),
            });
        }

        let salt = decode_b64(&persisted.salt, "salt")?;
        let root = Self::root_cipher(secret, &salt);
        let master = decrypt_with(&root, &persisted.key, KEY_STORAGE_KEY)?;
        if master.len() != KEY_SIZE {
            return Err(SdkError::Encryption {
                message: "unwrapped key has wrong length".to_string(),
            });
        }

        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&master)),
        })
    }

    async fn create_and_persist(
        secret: &str,
        backend: &dyn StorageBackend,
    ) -> Result<Self, SdkError> {
        let mut rng = rand::rng();
        let mut salt = [0u8; SALT_SIZE];
        rng.fill_bytes(&mut salt);
        let mut master = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut master);

        let root = Self::root_cipher(secret, &salt);
        let wrapped = encrypt_with(&root, &master, KEY_STORAGE_KEY)?;

        let persisted = PersistedKey {
            v: KEY_LAYOUT_VERSION,
            salt: BASE64.encode(salt),
            key: wrapped,
        };
        let raw = serde_json::to_vec(&persisted).map_err(|err| SdkError::Encryption {
            message: format!("cannot serialize key record: {err}"),
        })?;
        backend.put(KEY_STORAGE_KEY, raw).await?;
        info!("generated new storage encryption key");

        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&master)),
        })
    }

    /// Derives the root (key-wrapping) cipher from the secret and salt.
    fn root_cipher(secret: &str, salt: &[u8]) -> Aes256Gcm {
        let mut derived = [0u8; KEY_SIZE];
        pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, PBKDF2_ITERATIONS, &mut derived);
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&derived))
    }

    /// Encrypts `plaintext` with `aad` (the entry key) as associated data.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Encryption`] on cipher failure.
    pub fn encrypt(&self, plaintext: &[u8], aad: &str) -> Result<CipherEnvelope, SdkError> {
        encrypt_with(&self.cipher, plaintext, aad)
    }

    /// Decrypts an envelope. Authentication covers the ciphertext and `aad`.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Encryption`] when authentication fails or the
    /// envelope is malformed.
    pub fn decrypt(&self, envelope: &CipherEnvelope, aad: &str) -> Result<Vec<u8>, SdkError> {
        decrypt_with(&self.cipher, envelope, aad)
    }
}

fn encrypt_with(
    cipher: &Aes256Gcm,
    plaintext: &[u8],
    aad: &str,
) -> Result<CipherEnvelope, SdkError> {
    let mut iv = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut iv);

    let mut sealed = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload { msg: plaintext, aad: aad.as_bytes() },
        )
        .map_err(|_| SdkError::Encryption { message: "encryption failed".to_string() })?;

    // aes-gcm appends the tag to the ciphertext; the envelope keeps it apart.
    let tag = sealed.split_off(sealed.len() - TAG_SIZE);

    Ok(CipherEnvelope {
        alg: "AES-GCM".to_string(),
        iv: BASE64.encode(iv),
        tag: BASE64.encode(tag),
        ct: BASE64.encode(sealed),
        v: 1,
    })
}

fn decrypt_with(
    cipher: &Aes256Gcm,
    envelope: &CipherEnvelope,
    aad: &str,
) -> Result<Vec<u8>, SdkError> {
    if envelope.alg != "AES-GCM" {
        return Err(SdkError::Encryption {
            message: format!("unsupported algorithm {}", envelope.alg),
        });
    }

    let iv = decode_b64(&envelope.iv, "iv")?;
    if iv.len() != NONCE_SIZE {
        return Err(SdkError::Encryption { message: "bad IV length".to_string() });
    }
    let mut sealed = decode_b64(&envelope.ct, "ct")?;
    sealed.extend_from_slice(&decode_b64(&envelope.tag, "tag")?);

    cipher
        .decrypt(
            Nonce::from_slice(&iv),
            Payload { msg: &sealed, aad: aad.as_bytes() },
        )
        .map_err(|_| SdkError::Encryption {
            message: "decryption failed: authentication error or corrupted data".to_string(),
        })
}

fn decode_b64(value: &str, field: &str) -> Result<Vec<u8>, SdkError> {
    BASE64.decode(value).map_err(|_| SdkError::Encryption {
        message: format!("invalid base64 in {field}"),
    })
}
