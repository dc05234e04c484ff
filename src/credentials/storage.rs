//! Token persistence backed by SQLite.
//!
//! Rows hold only sealed token bytes; the store never sees plaintext and never
//! decrypts. At most one row exists per app id.

use super::StoredTokenRecord;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Persistence contract for sealed token records.
///
/// Writes following a refresh go through the `*_if_unchanged` style methods:
/// the caller passes the `updated_at` it read, and a `false` return means
/// another writer got there first and the record must be re-read.
pub trait TokenStore: Send + Sync {
    /// Creates tables if missing. Idempotent; called once at startup.
    fn ensure_schema(&self) -> Result<()>;

    fn get(&self, app_id: &str) -> Result<Option<StoredTokenRecord>>;

    /// Inserts or replaces the record for `record.app_id`.
    fn upsert(&self, record: &StoredTokenRecord) -> Result<()>;

    /// Replaces the record only if its `updated_at` still equals `expected_updated_at`.
    fn replace_if_unchanged(
        &self,
        record: &StoredTokenRecord,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drops the refresh token, guarded the same way as `replace_if_unchanged`.
    fn clear_refresh_token(&self, app_id: &str, expected_updated_at: DateTime<Utc>)
        -> Result<bool>;

    /// Manual revocation. Returns false if there was nothing to delete.
    fn delete(&self, app_id: &str) -> Result<bool>;

    fn list_app_ids(&self) -> Result<Vec<String>>;
}

/// SQLite-backed [`TokenStore`].
///
/// # Schema
/// ```sql
/// CREATE TABLE auth_tokens (
///     app_id             TEXT PRIMARY KEY,
///     access_token       BLOB NOT NULL,  -- nonce || ciphertext || tag
///     refresh_token      BLOB,           -- same layout (optional)
///     expires_at         TEXT NOT NULL,  -- RFC 3339
///     refresh_expires_at TEXT,           -- RFC 3339 (optional)
///     created_at         TEXT NOT NULL,
///     updated_at         TEXT NOT NULL   -- RFC 3339, nanosecond precision
/// );
/// ```
///
/// Both executables may open the same file, so a busy timeout is set rather
/// than failing on the first lock conflict.
pub struct SqliteTokenStore {
    conn: Mutex<Connection>,
}

fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in token store: {}", value))
}

impl SqliteTokenStore {
    /// Opens (or creates) the database file. Call [`TokenStore::ensure_schema`] before use.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open token database at {}", db_path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Token store connection lock poisoned"))
    }
}

impl TokenStore for SqliteTokenStore {
    fn ensure_schema(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS auth_tokens (
                    app_id             TEXT PRIMARY KEY,
                    access_token       BLOB NOT NULL,
                    refresh_token      BLOB,
                    expires_at         TEXT NOT NULL,
                    refresh_expires_at TEXT,
                    created_at         TEXT NOT NULL,
                    updated_at         TEXT NOT NULL
                );
                "#,
            )
            .context("Failed to create auth_tokens table")?;
        Ok(())
    }

    fn get(&self, app_id: &str) -> Result<Option<StoredTokenRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT access_token, refresh_token, expires_at, refresh_expires_at, updated_at
                FROM auth_tokens
                WHERE app_id = ?1
                "#,
                params![app_id],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Option<Vec<u8>>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to read token record")?;

        let Some((access_token, refresh_token, expires_at, refresh_expires_at, updated_at)) = row
        else {
            return Ok(None);
        };

        Ok(Some(StoredTokenRecord {
            app_id: app_id.to_string(),
            access_token,
            refresh_token,
            expires_at: parse_timestamp(&expires_at)?,
            refresh_expires_at: refresh_expires_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            updated_at: parse_timestamp(&updated_at)?,
        }))
    }

    fn upsert(&self, record: &StoredTokenRecord) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO auth_tokens (
                    app_id, access_token, refresh_token,
                    expires_at, refresh_expires_at, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                ON CONFLICT(app_id) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    expires_at = excluded.expires_at,
                    refresh_expires_at = excluded.refresh_expires_at,
                    updated_at = excluded.updated_at
                "#,
                params![
                    record.app_id,
                    record.access_token,
                    record.refresh_token,
                    timestamp(&record.expires_at),
                    record.refresh_expires_at.as_ref().map(timestamp),
                    timestamp(&record.updated_at),
                ],
            )
            .context("Failed to store token record")?;
        Ok(())
    }

    fn replace_if_unchanged(
        &self,
        record: &StoredTokenRecord,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = self
            .conn()?
            .execute(
                r#"
                UPDATE auth_tokens SET
                    access_token = ?2,
                    refresh_token = ?3,
                    expires_at = ?4,
                    refresh_expires_at = ?5,
                    updated_at = ?6
                WHERE app_id = ?1 AND updated_at = ?7
                "#,
                params![
                    record.app_id,
                    record.access_token,
                    record.refresh_token,
                    timestamp(&record.expires_at),
                    record.refresh_expires_at.as_ref().map(timestamp),
                    timestamp(&record.updated_at),
                    timestamp(&expected_updated_at),
                ],
            )
            .context("Failed to replace token record")?;
        Ok(rows > 0)
    }

    fn clear_refresh_token(
        &self,
        app_id: &str,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = self
            .conn()?
            .execute(
                r#"
                UPDATE auth_tokens SET
                    refresh_token = NULL,
                    refresh_expires_at = NULL,
                    updated_at = ?2
                WHERE app_id = ?1 AND updated_at = ?3
                "#,
                params![
                    app_id,
                    timestamp(&Utc::now()),
                    timestamp(&expected_updated_at),
                ],
            )
            .context("Failed to clear refresh token")?;
        Ok(rows > 0)
    }

    fn delete(&self, app_id: &str) -> Result<bool> {
        let rows = self
            .conn()?
            .execute("DELETE FROM auth_tokens WHERE app_id = ?1", params![app_id])
            .context("Failed to delete token record")?;
        Ok(rows > 0)
    }

    fn list_app_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT app_id FROM auth_tokens ORDER BY app_id")
            .context("Failed to prepare query")?;

        let ids = stmt
            .query_map([], |row| row.get(0))
            .context("Failed to execute query")?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to read results")?;

        Ok(ids)
    }
}
