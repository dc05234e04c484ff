//! File-backed, single-slot authorization-code mailbox.

use super::{
    normalize_submission, parse_handoff, AuthCodeProvider, AuthorizationCode,
    AuthorizationNotifier, AuthorizationRequest, ConsoleNotifier, HandoffError, HandoffPayload,
};
use async_trait::async_trait;
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

/// Mailbox file name is `{app_id}_{AUTH_CODE_SUFFIX}`.
pub const AUTH_CODE_SUFFIX: &str = "auth_code";

/// One mailbox file per app under a shared token directory.
///
/// Both sides use it: the submitter calls [`FileMailbox::submit`], the token
/// fetcher waits through [`AuthCodeProvider::await_code`].
#[derive(Clone)]
pub struct FileMailbox {
    token_dir: PathBuf,
    poll_interval: Duration,
    notifier: Arc<dyn AuthorizationNotifier>,
}

impl FileMailbox {
    pub fn new(token_dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            token_dir: token_dir.into(),
            poll_interval,
            notifier: Arc::new(ConsoleNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AuthorizationNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn mailbox_path(&self, app_id: &str) -> PathBuf {
        self.token_dir
            .join(format!("{}_{}", app_id, AUTH_CODE_SUFFIX))
    }

    /// Hidden sibling of the mailbox file, unique to this call.
    fn private_path(&self, app_id: &str, kind: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        self.token_dir.join(format!(
            ".{}_{}.{}-{}-{}",
            app_id,
            AUTH_CODE_SUFFIX,
            kind,
            std::process::id(),
            nonce
        ))
    }

    fn io_error(path: &Path, source: std::io::Error) -> HandoffError {
        HandoffError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn ensure_dir(&self) -> Result<(), HandoffError> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder
            .create(&self.token_dir)
            .map_err(|e| Self::io_error(&self.token_dir, e))
    }

    /// Writes pasted input into the app's mailbox, replacing previous content.
    ///
    /// The write goes to a temp file that is renamed into place, so a polling
    /// reader never sees a half-written value. Returns the mailbox path.
    pub fn submit(&self, app_id: &str, raw_input: &str) -> Result<PathBuf, HandoffError> {
        let content = normalize_submission(raw_input)?;
        self.ensure_dir()?;

        let path = self.mailbox_path(app_id);
        let temp_path = self.private_path(app_id, "tmp");

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let write_result = (|| -> std::io::Result<()> {
            let mut file = options.open(&temp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            Ok(())
        })();

        if let Err(e) = write_result {
            let _ = fs::remove_file(&temp_path);
            return Err(Self::io_error(&temp_path, e));
        }

        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(Self::io_error(&path, e));
        }

        info!(app_id = %app_id, path = %path.display(), "Authorization code written to mailbox");
        Ok(path)
    }

    /// Moves the mailbox file to a path only this caller knows.
    ///
    /// A submission renamed into place afterwards lands in a fresh mailbox
    /// file and is left for the next read.
    fn claim(&self, app_id: &str) -> Result<Option<PathBuf>, HandoffError> {
        let path = self.mailbox_path(app_id);
        let claimed = self.private_path(app_id, "claim");
        match fs::rename(&path, &claimed) {
            Ok(()) => Ok(Some(claimed)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }

    /// Reads and removes the mailbox content, if any.
    ///
    /// The file is claimed before it is read so the same code can never be
    /// consumed twice.
    pub fn take(&self, app_id: &str) -> Result<Option<String>, HandoffError> {
        let Some(claimed) = self.claim(app_id)? else {
            return Ok(None);
        };
        Self::read_claimed(app_id, &claimed)
    }

    fn read_claimed(app_id: &str, claimed: &Path) -> Result<Option<String>, HandoffError> {
        let content = fs::read_to_string(claimed);
        if let Err(e) = fs::remove_file(claimed) {
            warn!(app_id = %app_id, path = %claimed.display(), error = %e, "Failed to remove claimed mailbox file");
        }
        let content = content.map_err(|e| Self::io_error(claimed, e))?;

        let content = content.trim();
        if content.is_empty() {
            warn!(app_id = %app_id, "Mailbox file was empty, ignoring");
            return Ok(None);
        }
        Ok(Some(content.to_string()))
    }

    /// Removes any pending content. Returns true if something was discarded.
    pub fn clear(&self, app_id: &str) -> Result<bool, HandoffError> {
        let path = self.mailbox_path(app_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }
}

#[async_trait]
impl AuthCodeProvider for FileMailbox {
    async fn await_code(
        &self,
        request: &AuthorizationRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AuthorizationCode, HandoffError> {
        let app_id = request.app_id.as_str();
        self.ensure_dir()?;

        // Anything already there predates this request's state value.
        if self.clear(app_id)? {
            info!(app_id = %app_id, "Discarded stale authorization code from mailbox");
        }

        let path = self.mailbox_path(app_id);
        self.notifier.notify(request, &path);

        let deadline = Instant::now() + timeout;
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(app_id = %app_id, "Authorization wait cancelled");
                    return Err(HandoffError::Cancelled);
                }
                _ = ticker.tick() => {}
            }

            if let Some(raw) = self.take(app_id)? {
                info!(app_id = %app_id, "Authorization input received from mailbox");
                return match parse_handoff(&raw) {
                    HandoffPayload::Code { code, state } => Ok(AuthorizationCode {
                        app_id: app_id.to_string(),
                        code,
                        state,
                        received_at: Utc::now(),
                    }),
                    HandoffPayload::Raw(code) => Ok(AuthorizationCode {
                        app_id: app_id.to_string(),
                        code,
                        state: None,
                        received_at: Utc::now(),
                    }),
                    HandoffPayload::Denied { error, description } => {
                        Err(HandoffError::Denied { error, description })
                    }
                };
            }

            if Instant::now() >= deadline {
                return Err(HandoffError::Timeout {
                    app_id: app_id.to_string(),
                    timeout,
                });
            }
        }
    }
}
