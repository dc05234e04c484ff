//! Per-deployment salt file.
//!
//! The salt is generated once, written with owner-only permissions and read back
//! on every start. It is never rewritten: rotating it would orphan every token
//! already encrypted under keys derived from it.

use rand::{rngs::OsRng, RngCore};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[cfg(unix)]
use std::os::unix::fs::DirBuilderExt;

/// Size of the salt in bytes
pub const SALT_SIZE: usize = 16;

/// Salt bytes read from (or freshly written to) the salt file
pub type EncryptionSalt = [u8; SALT_SIZE];

#[derive(Debug, thiserror::Error)]
pub enum SaltError {
    /// The file exists but does not hold exactly `SALT_SIZE` bytes.
    #[error("salt file {path} has incorrect size: expected {expected} bytes, got {actual}")]
    Integrity {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("salt file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SaltError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        SaltError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Returns the salt stored at `path`, creating it on first use.
pub fn get_or_create_salt(path: &Path) -> Result<EncryptionSalt, SaltError> {
    ensure_parent_dir(path)?;

    match fs::read(path) {
        Ok(bytes) => {
            let salt: EncryptionSalt =
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| SaltError::Integrity {
                        path: path.to_path_buf(),
                        expected: SALT_SIZE,
                        actual: bytes.len(),
                    })?;
            debug!(path = %path.display(), "Loaded encryption salt");
            Ok(salt)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => create_salt(path),
        Err(e) => Err(SaltError::io(path, e)),
    }
}

fn create_salt(path: &Path) -> Result<EncryptionSalt, SaltError> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);

    // Written in full beside the target, then linked in without replacing.
    // Temp files are created 0600.
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::Builder::new()
        .prefix(".salt-")
        .tempfile_in(dir)
        .map_err(|e| SaltError::io(dir, e))?;
    temp.write_all(&salt)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| SaltError::io(path, e))?;

    match temp.persist_noclobber(path) {
        Ok(_) => {
            info!(path = %path.display(), "Generated new encryption salt");
            Ok(salt)
        }
        // Another process won the race: use theirs.
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => get_or_create_salt(path),
        Err(e) => Err(SaltError::io(path, e.error)),
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), SaltError> {
    let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return Ok(());
    };

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(dir).map_err(|e| SaltError::io(dir, e))
}
