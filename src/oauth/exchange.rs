//! Token endpoint client.
//!
//! Handles exchanging authorization codes for tokens and refreshing them.
//! Client credentials travel as HTTP Basic auth; the body is a form POST.

use crate::config::AppCredentialConfig;
use crate::error::AuthError;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// OAuth token response (standard OAuth 2.0 plus the refresh-token lifetime)
#[derive(Deserialize, Debug, Clone)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token_expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// OAuth error body (`{"error": "...", "error_description": "..."}`)
#[derive(Deserialize, Debug, Default)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Error code the provider uses for a dead code or refresh token
pub const INVALID_GRANT: &str = "invalid_grant";

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network failure, timeout, 429 or 5xx. Worth retrying.
    #[error("{0}")]
    Transient(String),

    /// The provider answered and refused.
    #[error("status {status}: {error}")]
    Rejected {
        status: u16,
        error: String,
        description: Option<String>,
    },
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// The grant itself is dead; a new authorization can fix it.
    pub fn is_invalid_grant(&self) -> bool {
        matches!(
            self,
            ProviderError::Rejected { status, error, .. } if error == INVALID_GRANT || *status == 401
        )
    }
}

impl From<ProviderError> for AuthError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Transient(message) => AuthError::ProviderTransient(message),
            ProviderError::Rejected {
                status,
                error,
                description,
            } => AuthError::ProviderRejected {
                status,
                error: match description {
                    Some(description) => format!("{} ({})", error, description),
                    None => error,
                },
            },
        }
    }
}

/// HTTP client for one or more apps' token endpoints.
#[derive(Clone, Debug)]
pub struct ProviderClient {
    http: reqwest::Client,
}

impl ProviderClient {
    /// `timeout` bounds each request, independently of the authorization wait.
    pub fn new(timeout: Duration) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    /// Exchange authorization code for tokens
    pub async fn exchange_code(
        &self,
        app: &AppCredentialConfig,
        code: &str,
    ) -> Result<TokenResponse, ProviderError> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", app.redirect_uri.as_str()),
        ];
        if let Some(verifier) = app.code_verifier.as_deref() {
            form.push(("code_verifier", verifier));
        }

        debug!(app_id = %app.id, token_url = %app.token_url, "Exchanging authorization code for token");
        self.post_token(app, &form).await
    }

    /// Trade a refresh token for a new access token
    pub async fn refresh(
        &self,
        app: &AppCredentialConfig,
        refresh_token: &str,
    ) -> Result<TokenResponse, ProviderError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        debug!(app_id = %app.id, token_url = %app.token_url, "Refreshing access token");
        self.post_token(app, &form).await
    }

    async fn post_token(
        &self,
        app: &AppCredentialConfig,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse, ProviderError> {
        let response = self
            .http
            .post(&app.token_url)
            .basic_auth(&app.client_id, Some(&app.client_secret))
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("Token request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(format!("Failed to read token response: {}", e)))?;

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::Transient(format!(
                "Token endpoint returned {}",
                status
            )));
        }

        if !status.is_success() {
            let parsed: ErrorResponse = serde_json::from_str(&body).unwrap_or_default();
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                error: parsed
                    .error
                    .unwrap_or_else(|| format!("http_{}", status.as_u16())),
                description: parsed.error_description,
            });
        }

        let token_response: TokenResponse =
            serde_json::from_str(&body).map_err(|e| ProviderError::Rejected {
                status: status.as_u16(),
                error: "invalid_response".to_string(),
                description: Some(e.to_string()),
            })?;

        debug!(
            app_id = %app.id,
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            "Token endpoint call successful"
        );

        Ok(token_response)
    }
}
