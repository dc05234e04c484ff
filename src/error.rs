//! Error types for the credential lifecycle

use crate::config::ConfigError;
use crate::credentials::{CryptoError, SaltError};
use crate::handoff::HandoffError;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by [`crate::oauth::TokenManager`] and its collaborators.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Missing or invalid app configuration. Not retryable.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Salt size mismatch or a sealed token that failed authentication.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// The operator did not hand off an authorization code in time.
    #[error("Timed out after {}s waiting for an authorization code for app '{app_id}'", .timeout.as_secs())]
    AuthorizationTimeout { app_id: String, timeout: Duration },

    /// The `state` returned with the code differs from the one issued.
    #[error("Authorization state mismatch for app '{app_id}' (possible forgery or stale redirect)")]
    AuthorizationState { app_id: String },

    /// The redirect carried `error=` instead of a code.
    #[error("Authorization denied: {error}{}", .description.as_deref().map(|d| format!(" - {}", d)).unwrap_or_default())]
    AuthorizationDenied {
        error: String,
        description: Option<String>,
    },

    /// Network failure, timeout or 5xx from the token endpoint.
    #[error("Token endpoint unavailable: {0}")]
    ProviderTransient(String),

    /// The token endpoint refused the grant.
    #[error("Token endpoint rejected the request ({status}): {error}")]
    ProviderRejected { status: u16, error: String },

    /// The caller cancelled while waiting.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Token store error: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error("Authorization code handoff failed: {0}")]
    Handoff(HandoffError),
}

impl AuthError {
    /// Whether re-invoking later can reasonably succeed without operator changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::AuthorizationTimeout { .. }
                | AuthError::AuthorizationState { .. }
                | AuthError::ProviderTransient(_)
                | AuthError::Cancelled
        )
    }
}

impl From<ConfigError> for AuthError {
    fn from(e: ConfigError) -> Self {
        AuthError::Configuration(e.to_string())
    }
}

impl From<HandoffError> for AuthError {
    fn from(e: HandoffError) -> Self {
        match e {
            HandoffError::Timeout { app_id, timeout } => {
                AuthError::AuthorizationTimeout { app_id, timeout }
            }
            HandoffError::Cancelled => AuthError::Cancelled,
            HandoffError::Denied { error, description } => {
                AuthError::AuthorizationDenied { error, description }
            }
            other => AuthError::Handoff(other),
        }
    }
}

impl From<SaltError> for AuthError {
    fn from(e: SaltError) -> Self {
        match e {
            SaltError::Integrity { .. } => AuthError::Integrity(e.to_string()),
            SaltError::Io { .. } => AuthError::Configuration(e.to_string()),
        }
    }
}

impl From<CryptoError> for AuthError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidKey(_) => AuthError::Configuration(e.to_string()),
            _ => AuthError::Integrity(e.to_string()),
        }
    }
}

/// Result type alias for credential lifecycle operations
pub type Result<T> = std::result::Result<T, AuthError>;
