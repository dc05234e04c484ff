//! Encrypted token storage.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TokenManager (oauth)               │
//! │  - only holder of plaintext tokens       │
//! └─────────────────────────────────────────┘
//!          ↓ seal                ↑ open
//! ┌─────────────────────────────────────────┐
//! │       TokenCipher                        │
//! │  - AES-256-GCM, nonce prefix per seal    │
//! │  - key = PBKDF2(app secret, salt)        │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       TokenStore (SQLite)                │
//! │  - sealed bytes only                     │
//! │  - one row per app id                    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use saxo_auth::credentials::{
//!     derive_key, get_or_create_salt, SqliteTokenStore, TokenCipher, TokenStore,
//! };
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let salt = get_or_create_salt(Path::new("secrets/encryption.salt"))?;
//! let cipher = TokenCipher::new(&derive_key("app-secret", &salt)?);
//!
//! let store = SqliteTokenStore::open("secrets/tokens.db")?;
//! store.ensure_schema()?;
//!
//! if let Some(record) = store.get("live")? {
//!     let access_token = cipher.open_string(&record.access_token)?;
//!     println!("{} chars", access_token.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Tokens are sealed before they reach the store
//! - Each seal uses a fresh random nonce
//! - Derived keys live in memory only
//! - A wrong salt, wrong secret or flipped byte surfaces as `CryptoError::Authentication`

use chrono::{DateTime, Utc};

mod encryption;
mod salt;
mod storage;

pub use encryption::{
    derive_key, CryptoError, DerivedKey, TokenCipher, KEY_SIZE, NONCE_SIZE, PBKDF2_ITERATIONS,
    TAG_SIZE,
};
pub use salt::{get_or_create_salt, EncryptionSalt, SaltError, SALT_SIZE};
pub use storage::{SqliteTokenStore, TokenStore};

/// Persisted token state for one app. Token fields are sealed bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredTokenRecord {
    pub app_id: String,

    /// Sealed access token (nonce || ciphertext || tag)
    pub access_token: Vec<u8>,

    /// Sealed refresh token, absent once the provider rejected it
    pub refresh_token: Option<Vec<u8>>,

    /// When the access token expires (UTC)
    pub expires_at: DateTime<Utc>,

    /// When the refresh token expires, if the provider said so
    pub refresh_expires_at: Option<DateTime<Utc>>,

    /// Last write; also the optimistic-concurrency version
    pub updated_at: DateTime<Utc>,
}

/// A plaintext bearer token handed to callers. Lives in memory only.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn as_str(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &format_args!("<{} chars>", self.token.len()))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
