//! Key derivation and AES-256-GCM sealing for stored tokens.
//!
//! The key is derived from the application secret and the deployment salt with
//! PBKDF2-HMAC-SHA256. Every sealed payload carries its own random nonce as a
//! prefix, so the output layout is `nonce (12) || ciphertext || tag (16)`.

use super::salt::SALT_SIZE;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use sha2::Sha256;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag appended to every ciphertext
pub const TAG_SIZE: usize = 16;

/// PBKDF2 iteration count.
///
/// Deployment-wide: tokens sealed under one value cannot be opened under
/// another, and the mismatch only shows up as authentication failures.
pub const PBKDF2_ITERATIONS: u32 = 390_000;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Bad key material or derivation input; raised before any cipher exists.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("ciphertext too short: {len} bytes, need at least {min} for the nonce", min = NONCE_SIZE)]
    TooShort { len: usize },

    /// The tag did not verify: tampered data, corrupted storage or wrong key.
    #[error("authentication failed (tampered data or wrong key)")]
    Authentication,

    #[error("encryption failed")]
    Encryption,

    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Symmetric key material. Never persisted, never printed.
#[derive(Clone)]
pub struct DerivedKey([u8; KEY_SIZE]);

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

/// Derives the token encryption key from an application secret and salt.
///
/// Deterministic: the same inputs always yield the same key.
pub fn derive_key(secret: &str, salt: &[u8]) -> Result<DerivedKey, CryptoError> {
    if secret.is_empty() {
        return Err(CryptoError::InvalidKey("secret must not be empty".to_string()));
    }
    if salt.len() != SALT_SIZE {
        return Err(CryptoError::InvalidKey(format!(
            "salt must be {} bytes, got {}",
            SALT_SIZE,
            salt.len()
        )));
    }

    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    Ok(DerivedKey(key))
}

/// AEAD cipher bound to one derived key.
#[derive(Clone)]
pub struct TokenCipher {
    aead: Aes256Gcm,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCipher(AES-256-GCM)")
    }
}

impl TokenCipher {
    pub fn new(key: &DerivedKey) -> Self {
        Self {
            aead: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes())),
        }
    }

    /// Builds a cipher from raw key bytes, rejecting anything but 32 bytes.
    pub fn from_slice(key: &[u8]) -> Result<Self, CryptoError> {
        let aead = Aes256Gcm::new_from_slice(key).map_err(|_| {
            CryptoError::InvalidKey(format!(
                "key must be {} bytes, got {}",
                KEY_SIZE,
                key.len()
            ))
        })?;
        Ok(Self { aead })
    }

    /// Encrypts `plaintext` under a fresh random nonce and prepends the nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        // Generate random nonce (never reuse!)
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .aead
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Splits off the nonce prefix and decrypts the remainder.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_SIZE {
            return Err(CryptoError::TooShort { len: sealed.len() });
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Authentication)
    }

    pub fn seal_str(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError> {
        self.seal(plaintext.as_bytes())
    }

    pub fn open_string(&self, sealed: &[u8]) -> Result<String, CryptoError> {
        String::from_utf8(self.open(sealed)?).map_err(|_| CryptoError::InvalidUtf8)
    }
}
