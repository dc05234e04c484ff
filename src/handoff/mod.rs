//! Out-of-band hand-off of OAuth authorization codes.
//!
//! The process that needs a token cannot receive the provider's browser
//! redirect. Instead it publishes the authorization URL to an operator and waits
//! on an [`AuthCodeProvider`]. The default provider is a file mailbox that a
//! second executable (`saxo-submit-code`) fills with the pasted redirect URL:
//!
//! ```text
//!  saxo-get-token                      operator                saxo-submit-code
//!  ──────────────                      ────────                ────────────────
//!  notify(auth URL) ─────────────────▶ opens URL, approves
//!                                      copies redirect URL ──▶ submit(raw)
//!  poll {token_dir}/{app}_auth_code ◀──────────────────────── writes code=…&state=…
//!  read + delete, verify state
//! ```

mod mailbox;

pub use mailbox::{FileMailbox, AUTH_CODE_SUFFIX};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// What the operator must act on: where to go and which `state` to expect back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub app_id: String,
    pub url: String,
    pub state: String,
}

/// A code received through the hand-off channel, consumed exactly once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorizationCode {
    pub app_id: String,
    pub code: String,
    /// `None` when the operator pasted a bare code rather than the redirect URL
    pub state: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("no authorization code for app '{app_id}' within {timeout:?}")]
    Timeout { app_id: String, timeout: Duration },

    #[error("wait for authorization code cancelled")]
    Cancelled,

    /// The redirect carried `error=…` (operator declined, or the provider refused).
    #[error("authorization denied: {error}")]
    Denied {
        error: String,
        description: Option<String>,
    },

    #[error("submitted authorization input is empty")]
    EmptySubmission,

    #[error("mailbox {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Source of authorization codes for the orchestrator.
///
/// Implementations present `request.url` to whoever can approve it and block
/// until a code arrives, `timeout` elapses or `cancel` fires. Nothing may be
/// consumed before a code is returned, so a cancelled wait can be retried.
#[async_trait]
pub trait AuthCodeProvider: Send + Sync {
    async fn await_code(
        &self,
        request: &AuthorizationRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AuthorizationCode, HandoffError>;
}

/// Presents an authorization URL to the operator.
///
/// The console notifier covers interactive use; deployments that alert an
/// operator elsewhere (chat bot, pager) plug in their own.
pub trait AuthorizationNotifier: Send + Sync {
    fn notify(&self, request: &AuthorizationRequest, mailbox: &Path);
}

/// Prints the authorization banner to stderr, keeping stdout free for the token.
#[derive(Clone, Debug, Default)]
pub struct ConsoleNotifier;

impl AuthorizationNotifier for ConsoleNotifier {
    fn notify(&self, request: &AuthorizationRequest, mailbox: &Path) {
        info!(
            app_id = %request.app_id,
            mailbox = %mailbox.display(),
            "Authorization required, waiting for operator"
        );

        let rule = "=".repeat(78);
        eprintln!("\n{}", rule);
        eprintln!("ACTION REQUIRED: authorization for app '{}'", request.app_id);
        eprintln!("1. Open the following URL in your browser:");
        eprintln!("   {}", request.url);
        eprintln!("2. Approve access. The provider redirects you to a new URL.");
        eprintln!("3. Copy that ENTIRE redirect URL and paste it into:");
        eprintln!("   saxo-submit-code {}", request.app_id);
        eprintln!("   (or write it to {})", mailbox.display());
        eprintln!("{}\n", rule);
    }
}

/// Query parameters a provider appends to the redirect URI.
#[derive(Debug, Default, Deserialize, Serialize)]
struct RedirectParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<String>,
    #[serde(default, skip_serializing)]
    error: Option<String>,
    #[serde(default, skip_serializing)]
    error_description: Option<String>,
}

/// Interpretation of whatever the operator handed off.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandoffPayload {
    /// A code, with the `state` that accompanied it if any
    Code { code: String, state: Option<String> },
    Denied {
        error: String,
        description: Option<String>,
    },
    /// Not recognisably a redirect; passed on as the code itself
    Raw(String),
}

/// Extracts the query portion of a redirect URL or bare `k=v&…` string.
fn query_part(input: &str) -> Option<&str> {
    let without_fragment = input.split('#').next().unwrap_or(input);
    match without_fragment.split_once('?') {
        Some((_, query)) => Some(query),
        None if without_fragment.contains('=') && !without_fragment.contains("://") => {
            Some(without_fragment)
        }
        None => None,
    }
}

fn parse_redirect(input: &str) -> Option<RedirectParams> {
    let query = query_part(input)?;
    serde_urlencoded::from_str::<RedirectParams>(query).ok()
}

/// Parses pasted input. Never fails on content: anything that is not a
/// recognisable redirect is returned verbatim as [`HandoffPayload::Raw`].
pub fn parse_handoff(input: &str) -> HandoffPayload {
    let trimmed = input.trim();
    match parse_redirect(trimmed) {
        Some(RedirectParams {
            error: Some(error),
            error_description,
            ..
        }) => HandoffPayload::Denied {
            error,
            description: error_description,
        },
        Some(RedirectParams {
            code: Some(code),
            state,
            ..
        }) if !code.is_empty() => HandoffPayload::Code { code, state },
        _ => HandoffPayload::Raw(trimmed.to_string()),
    }
}

/// Reduces a pasted redirect to the part worth persisting.
///
/// `https://host/cb?code=ABC&state=XYZ&session=…` becomes `code=ABC&state=XYZ`;
/// anything without a `code` parameter is kept verbatim (trimmed).
pub fn normalize_submission(input: &str) -> Result<String, HandoffError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(HandoffError::EmptySubmission);
    }

    match parse_redirect(trimmed) {
        Some(params @ RedirectParams { code: Some(_), error: None, .. }) => {
            Ok(serde_urlencoded::to_string(&params).unwrap_or_else(|_| trimmed.to_string()))
        }
        _ => Ok(trimmed.to_string()),
    }
}
