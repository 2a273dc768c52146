//! Password-derived payload encryption using AES-256-GCM
//!
//! A user password is stretched with PBKDF2-HMAC-SHA256 into a 256-bit key
//! that never leaves [`EncryptionService`]. Payloads are sealed with
//! AES-256-GCM under a fresh random nonce per call.
//!
//! # Envelope
//!
//! ```text
//! EncryptedData {
//!     ciphertext: AES-256-GCM(json(data)) + auth_tag (16 bytes)
//!     iv:         12-byte random nonce
//!     salt:       16-byte PBKDF2 salt used at initialize()
//!     version:    1
//! }
//! ```
//!
//! # Example
//!
//! ```
//! use offsync_core::crypto::EncryptionService;
//!
//! let service = EncryptionService::with_iterations(1_000);
//! let salt = service.initialize("correct-horse", None).unwrap();
//! assert_eq!(salt.len(), 16);
//!
//! let sealed = service.encrypt(&serde_json::json!({"note": "hello"})).unwrap();
//! let opened: serde_json::Value = service.decrypt(&sealed).unwrap();
//! assert_eq!(opened["note"], "hello");
//! ```

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use parking_lot::RwLock;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{SyncError, SyncResult};

/// PBKDF2 salt size (16 bytes)
pub const SALT_SIZE: usize = 16;

/// Nonce size for AES-256-GCM (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Derived key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// Default PBKDF2 work factor
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Envelope format tag: PBKDF2-HMAC-SHA256 + AES-256-GCM
pub const FORMAT_VERSION: u32 = 1;

/// Encrypted payload envelope.
///
/// Only [`EncryptionService`] produces these; byte fields serialize as
/// base64 strings so the envelope can travel inside a JSON payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    #[serde(with = "base64_bytes")]
    ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    salt: Vec<u8>,
    version: u32,
}

impl EncryptedData {
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Salt the sealing key was derived with
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

/// Result of [`EncryptionService::change_password`]
#[derive(Debug, Clone)]
pub struct PasswordChange {
    /// Salt for the new password; callers persist it for the next initialize
    pub new_salt: Vec<u8>,
    /// Input records re-sealed under the new key, in input order
    pub records: Vec<EncryptedData>,
}

/// Live key material
struct KeyState {
    cipher: Aes256Gcm,
    key: Zeroizing<[u8; KEY_SIZE]>,
    salt: Vec<u8>,
}

impl KeyState {
    fn derive(password: &str, salt: &[u8], iterations: u32) -> SyncResult<Self> {
        let key = derive_key(password, salt, iterations);
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| SyncError::Crypto(format!("Key setup failed: {}", e)))?;
        Ok(Self {
            cipher,
            key,
            salt: salt.to_vec(),
        })
    }

    fn seal(&self, plaintext: &[u8]) -> SyncResult<EncryptedData> {
        let mut iv = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut iv);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|e| SyncError::Crypto(format!("Encryption failed: {}", e)))?;

        Ok(EncryptedData {
            ciphertext,
            iv: iv.to_vec(),
            salt: self.salt.clone(),
            version: FORMAT_VERSION,
        })
    }

    fn open(&self, encrypted: &EncryptedData) -> SyncResult<Zeroizing<Vec<u8>>> {
        if encrypted.version != FORMAT_VERSION {
            return Err(SyncError::UnsupportedVersion(encrypted.version));
        }
        if encrypted.iv.len() != NONCE_SIZE {
            return Err(SyncError::DecryptionFailed);
        }

        self.cipher
            .decrypt(Nonce::from_slice(&encrypted.iv), encrypted.ciphertext.as_slice())
            .map(Zeroizing::new)
            .map_err(|_| SyncError::DecryptionFailed)
    }
}

fn derive_key(password: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, key.as_mut_slice());
    key
}

/// Constant-time key comparison
fn keys_match(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_SIZE];
    rand::rng().fill_bytes(&mut salt);
    salt
}

/// Holds a password-derived key and seals/opens payloads with it.
///
/// The key is not exportable: the only way to get it back is to derive it
/// again from the password and salt. Construct one per application (or per
/// encrypted store) and pass it where needed.
pub struct EncryptionService {
    iterations: u32,
    state: RwLock<Option<KeyState>>,
}

impl fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionService")
            .field("iterations", &self.iterations)
            .field("initialized", &self.is_initialized())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl Default for EncryptionService {
    fn default() -> Self {
        Self::new()
    }
}

impl EncryptionService {
    /// Create an uninitialized service using [`PBKDF2_ITERATIONS`]
    pub fn new() -> Self {
        Self::with_iterations(PBKDF2_ITERATIONS)
    }

    /// Create an uninitialized service with a custom PBKDF2 work factor.
    ///
    /// Every instance that must open the same data needs the same value.
    pub fn with_iterations(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
            state: RwLock::new(None),
        }
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Derive the key from `password`.
    ///
    /// Pass `existing_salt` when rejoining a previously encrypted store;
    /// otherwise a fresh 16-byte salt is generated. Returns the salt so the
    /// caller can persist it. The same password and salt always give the same key.
    pub fn initialize(&self, password: &str, existing_salt: Option<&[u8]>) -> SyncResult<Vec<u8>> {
        if password.is_empty() {
            return Err(SyncError::InvalidInput("password must not be empty".to_string()));
        }
        let salt = match existing_salt {
            Some([]) => {
                return Err(SyncError::InvalidInput("salt must not be empty".to_string()));
            }
            Some(salt) => salt.to_vec(),
            None => generate_salt(),
        };

        let key_state = KeyState::derive(password, &salt, self.iterations)?;
        *self.state.write() = Some(key_state);

        debug!(
            reused_salt = existing_salt.is_some(),
            "Encryption key derived"
        );
        Ok(salt)
    }

    /// True iff a key is currently held
    pub fn is_initialized(&self) -> bool {
        self.state.read().is_some()
    }

    /// Salt of the live key, if initialized
    pub fn salt(&self) -> Option<Vec<u8>> {
        self.state.read().as_ref().map(|s| s.salt.clone())
    }

    /// Serialize `data` as JSON and seal it.
    pub fn encrypt<T: Serialize + ?Sized>(&self, data: &T) -> SyncResult<EncryptedData> {
        let plaintext = Zeroizing::new(serde_json::to_vec(data)?);
        self.encrypt_bytes(&plaintext)
    }

    /// Open an envelope and deserialize the JSON inside.
    pub fn decrypt<T: DeserializeOwned>(&self, encrypted: &EncryptedData) -> SyncResult<T> {
        let plaintext = self.decrypt_bytes(encrypted)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Seal raw bytes under a fresh nonce
    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> SyncResult<EncryptedData> {
        let state = self.state.read();
        let key_state = state.as_ref().ok_or(SyncError::NotInitialized)?;
        key_state.seal(plaintext)
    }

    /// Open raw bytes; fails with `DecryptionFailed` on any authentication error
    pub fn decrypt_bytes(&self, encrypted: &EncryptedData) -> SyncResult<Zeroizing<Vec<u8>>> {
        let state = self.state.read();
        let key_state = state.as_ref().ok_or(SyncError::NotInitialized)?;
        key_state.open(encrypted)
    }

    /// Check a password against a known record without touching live state.
    ///
    /// Any failure (bad salt, wrong password, tampered record) yields `false`.
    pub fn verify_password(&self, password: &str, salt: &[u8], test_record: &EncryptedData) -> bool {
        let candidate = EncryptionService::with_iterations(self.iterations);
        if candidate.initialize(password, Some(salt)).is_err() {
            return false;
        }
        candidate.decrypt_bytes(test_record).is_ok()
    }

    /// Rotate to a new password, re-encrypting `records` under the new key.
    ///
    /// All or nothing: `old_password` must reproduce the live key and every
    /// record must open under it, otherwise nothing is re-encrypted and the
    /// live key stays as it was. A wrong old password reports `DecryptionFailed`.
    pub fn change_password(
        &self,
        old_password: &str,
        new_password: &str,
        records: &[EncryptedData],
    ) -> SyncResult<PasswordChange> {
        if new_password.is_empty() {
            return Err(SyncError::InvalidInput("password must not be empty".to_string()));
        }

        let mut state = self.state.write();
        let current = state.as_ref().ok_or(SyncError::NotInitialized)?;

        let old_key = derive_key(old_password, &current.salt, self.iterations);
        if !keys_match(old_key.as_slice(), current.key.as_slice()) {
            return Err(SyncError::DecryptionFailed);
        }

        let plaintexts = records
            .iter()
            .map(|record| current.open(record))
            .collect::<SyncResult<Vec<_>>>()?;

        let new_salt = generate_salt();
        let next = KeyState::derive(new_password, &new_salt, self.iterations)?;
        let reencrypted = plaintexts
            .iter()
            .map(|plaintext| next.seal(plaintext))
            .collect::<SyncResult<Vec<_>>>()?;

        *state = Some(next);
        info!(records = reencrypted.len(), "Encryption password rotated");

        Ok(PasswordChange {
            new_salt,
            records: reencrypted,
        })
    }

    /// Discard the key and salt
    pub fn clear(&self) {
        *self.state.write() = None;
        debug!("Encryption key cleared");
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
