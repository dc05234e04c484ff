//! Token lifecycle orchestration.

use super::exchange::{ProviderClient, ProviderError, TokenResponse};
use super::provider::build_authorization_url;
use super::state_manager::StateManager;
use super::FlowState;
use crate::config::{AppCredentialConfig, AuthServiceConfig, AuthSettings};
use crate::credentials::{
    derive_key, get_or_create_salt, AccessToken, StoredTokenRecord, TokenCipher, TokenStore,
};
use crate::error::{AuthError, Result};
use crate::handoff::{AuthCodeProvider, AuthorizationCode, AuthorizationRequest};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Extra lifetime for issued states past the operator wait.
///
/// The mailbox is read on the poll tick after a submission, which can land
/// after the wait's deadline.
const STATE_GRACE: std::time::Duration = std::time::Duration::from_secs(30);

/// One configured app and the cipher derived from its secret
struct ManagedApp {
    config: AppCredentialConfig,
    cipher: TokenCipher,
}

/// Internal step of the flow; carries what the next state needs.
enum Step {
    Load,
    NoToken,
    NeedsRefresh(StoredTokenRecord),
    RefreshingToken {
        record: StoredTokenRecord,
        refresh_token: String,
    },
    AwaitingAuthorization,
    ExchangingCode(AuthorizationCode),
    Valid(AccessToken),
}

impl Step {
    fn flow_state(&self) -> Option<FlowState> {
        match self {
            Step::Load => None,
            Step::NoToken => Some(FlowState::NoToken),
            Step::NeedsRefresh(_) => Some(FlowState::NeedsRefresh),
            Step::RefreshingToken { .. } => Some(FlowState::RefreshingToken),
            Step::AwaitingAuthorization => Some(FlowState::AwaitingAuthorization),
            Step::ExchangingCode(_) => Some(FlowState::ExchangingCode),
            Step::Valid(_) => Some(FlowState::Valid),
        }
    }
}

/// Issues, persists and refreshes access tokens for configured apps.
///
/// Built once at startup and shared. Calls for the same app are serialized;
/// different apps proceed in parallel.
pub struct TokenManager {
    apps: HashMap<String, ManagedApp>,
    store: Arc<dyn TokenStore>,
    codes: Arc<dyn AuthCodeProvider>,
    provider: ProviderClient,
    settings: AuthSettings,
    locks: DashMap<String, Arc<Mutex<()>>>,
    states: StateManager,
}

impl TokenManager {
    pub fn new(
        settings: AuthSettings,
        store: Arc<dyn TokenStore>,
        codes: Arc<dyn AuthCodeProvider>,
    ) -> Result<Self> {
        settings.validate()?;
        let provider = ProviderClient::new(settings.http_timeout())?;
        let states = StateManager::new(
            settings.authorization_timeout() + settings.poll_interval() + STATE_GRACE,
        );
        Ok(Self {
            apps: HashMap::new(),
            store,
            codes,
            provider,
            settings,
            locks: DashMap::new(),
            states,
        })
    }

    /// Registers an app with an already-derived cipher.
    pub fn with_app(mut self, config: AppCredentialConfig, cipher: TokenCipher) -> Self {
        self.apps
            .insert(config.id.clone(), ManagedApp { config, cipher });
        self
    }

    /// Builds a manager for every configured app.
    ///
    /// Reads (or creates) the deployment salt and derives one key per app from
    /// its client secret.
    pub fn from_config(
        config: &AuthServiceConfig,
        store: Arc<dyn TokenStore>,
        codes: Arc<dyn AuthCodeProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let salt = get_or_create_salt(&config.secrets.salt_path())?;

        let mut manager = Self::new(config.auth.clone(), store, codes)?;
        for app in &config.apps {
            let cipher = TokenCipher::new(&derive_key(&app.client_secret, &salt)?);
            manager = manager.with_app(app.clone(), cipher);
        }

        info!(apps = manager.apps.len(), "Token manager ready");
        Ok(manager)
    }

    pub fn app_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.apps.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn app(&self, app_id: &str) -> Result<&ManagedApp> {
        self.apps
            .get(app_id)
            .ok_or_else(|| AuthError::Configuration(format!("no app named '{}' in configuration", app_id)))
    }

    fn app_lock(&self, app_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(app_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Returns a valid access token for `app_id`, authorizing if needed.
    pub async fn get_token(&self, app_id: &str) -> Result<AccessToken> {
        self.get_token_with_cancel(app_id, &CancellationToken::new())
            .await
    }

    /// Like [`get_token`](Self::get_token), abandoning the operator wait,
    /// retries and in-flight requests when `cancel` fires.
    pub async fn get_token_with_cancel(
        &self,
        app_id: &str,
        cancel: &CancellationToken,
    ) -> Result<AccessToken> {
        let app = self.app(app_id)?;
        let lock = self.app_lock(app_id);
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuthError::Cancelled),
            guard = lock.lock() => guard,
        };

        self.run_flow(app, cancel).await
    }

    /// Deletes the stored record for `app_id`. Returns false if none existed.
    pub async fn revoke(&self, app_id: &str) -> Result<bool> {
        self.app(app_id)?;
        let lock = self.app_lock(app_id);
        let _guard = lock.lock().await;

        let deleted = self.store.delete(app_id)?;
        if deleted {
            info!(app_id = %app_id, "Stored token record revoked");
        } else {
            info!(app_id = %app_id, "No stored token record to revoke");
        }
        Ok(deleted)
    }

    async fn run_flow(&self, app: &ManagedApp, cancel: &CancellationToken) -> Result<AccessToken> {
        let app_id = app.config.id.as_str();
        let margin = ChronoDuration::seconds(self.settings.expiry_margin_seconds);
        let mut authorization_attempts = 0u32;
        let mut last_error: Option<AuthError> = None;
        let mut step = Step::Load;

        loop {
            let from = step.flow_state();
            step = match step {
                Step::Load => self.load(app, margin)?,

                Step::NoToken => Step::AwaitingAuthorization,

                Step::NeedsRefresh(record) => self.usable_refresh_token(app, record),

                Step::RefreshingToken {
                    record,
                    refresh_token,
                } => self.refresh(app, record, &refresh_token, cancel).await?,

                Step::AwaitingAuthorization => {
                    if authorization_attempts >= self.settings.max_authorization_attempts {
                        warn!(
                            app_id = %app_id,
                            attempts = authorization_attempts,
                            "Giving up on authorization"
                        );
                        return Err(last_error.unwrap_or_else(|| {
                            AuthError::Configuration(
                                "auth.max_authorization_attempts must be greater than zero".to_string(),
                            )
                        }));
                    }
                    authorization_attempts += 1;

                    match self.authorize(app, cancel).await? {
                        Ok(code) => Step::ExchangingCode(code),
                        Err(e) => {
                            last_error = Some(e);
                            Step::AwaitingAuthorization
                        }
                    }
                }

                Step::ExchangingCode(code) => match self.exchange(app, &code, cancel).await? {
                    Ok(token) => Step::Valid(token),
                    Err(e) => {
                        last_error = Some(e);
                        Step::AwaitingAuthorization
                    }
                },

                Step::Valid(token) => {
                    info!(app_id = %app_id, expires_at = %token.expires_at, "Access token ready");
                    return Ok(token);
                }
            };

            if let (Some(from), Some(to)) = (from, step.flow_state()) {
                debug!(app_id = %app_id, from = %from, to = %to, "Token flow transition");
            }
        }
    }

    /// Entry: classify whatever the store holds.
    fn load(&self, app: &ManagedApp, margin: ChronoDuration) -> Result<Step> {
        let app_id = app.config.id.as_str();
        let Some(record) = self.store.get(app_id)? else {
            info!(app_id = %app_id, "No stored token");
            return Ok(Step::NoToken);
        };

        match app.cipher.open_string(&record.access_token) {
            Ok(token) if record.expires_at > Utc::now() + margin => {
                debug!(app_id = %app_id, expires_at = %record.expires_at, "Stored access token still valid");
                Ok(Step::Valid(AccessToken {
                    token,
                    expires_at: record.expires_at,
                }))
            }
            Ok(_) => {
                info!(app_id = %app_id, expires_at = %record.expires_at, "Access token expired or expiring");
                Ok(Step::NeedsRefresh(record))
            }
            Err(e) => {
                warn!(
                    app_id = %app_id,
                    error = %e,
                    "Stored access token failed integrity check (tampering or salt/secret mismatch); re-authorizing"
                );
                Ok(Step::AwaitingAuthorization)
            }
        }
    }

    /// Decides whether the record's refresh token is worth sending.
    fn usable_refresh_token(&self, app: &ManagedApp, record: StoredTokenRecord) -> Step {
        let app_id = app.config.id.as_str();
        let Some(sealed) = record.refresh_token.as_deref() else {
            info!(app_id = %app_id, "No refresh token stored");
            return Step::AwaitingAuthorization;
        };

        let refresh_margin = ChronoDuration::seconds(self.settings.refresh_expiry_margin_seconds);
        if let Some(refresh_expires_at) = record.refresh_expires_at {
            if refresh_expires_at <= Utc::now() + refresh_margin {
                info!(
                    app_id = %app_id,
                    refresh_expires_at = %refresh_expires_at,
                    "Refresh token expired or expiring"
                );
                return Step::AwaitingAuthorization;
            }
        }

        match app.cipher.open_string(sealed) {
            Ok(refresh_token) => Step::RefreshingToken {
                record,
                refresh_token,
            },
            Err(e) => {
                warn!(
                    app_id = %app_id,
                    error = %e,
                    "Stored refresh token failed integrity check; re-authorizing"
                );
                Step::AwaitingAuthorization
            }
        }
    }

    async fn refresh(
        &self,
        app: &ManagedApp,
        record: StoredTokenRecord,
        refresh_token: &str,
        cancel: &CancellationToken,
    ) -> Result<Step> {
        let app_id = app.config.id.as_str();
        info!(app_id = %app_id, "Refreshing access token");

        let outcome = self
            .call_with_retries(app_id, "refresh", cancel, move || {
                self.provider.refresh(&app.config, refresh_token)
            })
            .await?;

        match outcome {
            Ok(response) => {
                let (updated, token) = self.seal_response(app, &response, Some(&record))?;
                if self.store.replace_if_unchanged(&updated, record.updated_at)? {
                    info!(app_id = %app_id, "Access token refreshed");
                    Ok(Step::Valid(token))
                } else {
                    info!(app_id = %app_id, "Token record changed concurrently; re-reading");
                    Ok(Step::Load)
                }
            }
            Err(e) if e.is_transient() => Err(e.into()),
            Err(e) => {
                warn!(app_id = %app_id, error = %e, "Refresh token rejected; clearing it");
                if self.store.clear_refresh_token(app_id, record.updated_at)? {
                    Ok(Step::AwaitingAuthorization)
                } else {
                    info!(app_id = %app_id, "Token record changed concurrently; re-reading");
                    Ok(Step::Load)
                }
            }
        }
    }

    /// Runs one authorization round.
    ///
    /// The outer error aborts the flow; the inner one is a failed round that
    /// may be retried with a fresh state.
    async fn authorize(
        &self,
        app: &ManagedApp,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<AuthorizationCode, AuthError>> {
        let app_id = app.config.id.as_str();
        let state = self.states.create_state(app_id);
        let request = AuthorizationRequest {
            app_id: app_id.to_string(),
            url: build_authorization_url(&app.config, &state),
            state,
        };

        info!(app_id = %app_id, "Authorization required");
        let code = match self
            .codes
            .await_code(&request, self.settings.authorization_timeout(), cancel)
            .await
        {
            Ok(code) => code,
            Err(e) => {
                self.states.discard(&request.state);
                return Err(e.into());
            }
        };

        match code.state.as_deref() {
            Some(returned)
                if returned == request.state
                    && self.states.validate_and_consume(app_id, returned) =>
            {
                debug!(app_id = %app_id, "Authorization state verified");
            }
            Some(_) => {
                self.states.discard(&request.state);
                warn!(
                    app_id = %app_id,
                    "Authorization state mismatch; discarding code and issuing a new URL"
                );
                return Ok(Err(AuthError::AuthorizationState {
                    app_id: app_id.to_string(),
                }));
            }
            None => {
                self.states.discard(&request.state);
                warn!(
                    app_id = %app_id,
                    "Authorization code arrived without state; origin cannot be verified"
                );
            }
        }

        Ok(Ok(code))
    }

    /// Exchanges a code. The inner error sends the flow back to authorization.
    async fn exchange(
        &self,
        app: &ManagedApp,
        code: &AuthorizationCode,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<AccessToken, AuthError>> {
        let app_id = app.config.id.as_str();
        info!(app_id = %app_id, "Exchanging authorization code");

        let outcome = self
            .call_with_retries(app_id, "exchange", cancel, move || {
                self.provider.exchange_code(&app.config, &code.code)
            })
            .await?;

        match outcome {
            Ok(response) => {
                let (record, token) = self.seal_response(app, &response, None)?;
                self.store.upsert(&record)?;
                info!(app_id = %app_id, "Authorization complete; token stored");
                Ok(Ok(token))
            }
            Err(e) if e.is_invalid_grant() => {
                warn!(app_id = %app_id, error = %e, "Authorization code rejected; authorizing again");
                Ok(Err(e.into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Calls the token endpoint, retrying transient failures with doubling backoff.
    ///
    /// Only cancellation surfaces as the outer error.
    async fn call_with_retries<F, Fut>(
        &self,
        app_id: &str,
        operation: &'static str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<std::result::Result<TokenResponse, ProviderError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<TokenResponse, ProviderError>>,
    {
        let max_attempts = self.settings.max_provider_attempts.max(1);
        let mut delay = self.settings.retry_backoff();
        let mut attempt = 1;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AuthError::Cancelled),
                result = call() => result,
            };

            match result {
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(
                        app_id = %app_id,
                        operation,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Token endpoint call failed, will retry"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(AuthError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        app_id = %app_id,
                        operation,
                        attempts = attempt,
                        error = %e,
                        "Token endpoint still failing, giving up"
                    );
                    return Ok(Err(e));
                }
                other => return Ok(other),
            }
        }
    }

    /// Seals a token response into a record plus the plaintext handed to the caller.
    ///
    /// When the provider does not rotate the refresh token, `previous` keeps supplying it.
    fn seal_response(
        &self,
        app: &ManagedApp,
        response: &TokenResponse,
        previous: Option<&StoredTokenRecord>,
    ) -> Result<(StoredTokenRecord, AccessToken)> {
        let app_id = app.config.id.as_str();
        if response.access_token.is_empty() {
            return Err(AuthError::ProviderRejected {
                status: 200,
                error: "invalid_response: empty access_token".to_string(),
            });
        }

        let now = Utc::now();
        let expires_at = match response.expires_in {
            Some(seconds) if seconds > 0 => expiry_after(now, seconds, "expires_in")?,
            Some(seconds) => {
                warn!(app_id = %app_id, expires_in = seconds, "Token response has non-positive expires_in; treating token as already expiring");
                now
            }
            None => {
                warn!(app_id = %app_id, "Token response has no expires_in; treating token as already expiring");
                now
            }
        };
        let refresh_expires_at: Option<DateTime<Utc>> = match response.refresh_token_expires_in {
            Some(seconds) if seconds > 0 => {
                Some(expiry_after(now, seconds, "refresh_token_expires_in")?)
            }
            Some(_) => Some(now),
            None => None,
        };

        let (refresh_token, refresh_expires_at) = match response.refresh_token.as_deref() {
            Some(refresh_token) => (Some(app.cipher.seal_str(refresh_token)?), refresh_expires_at),
            // Keep the existing refresh token if the provider did not rotate it
            None => match previous {
                Some(previous) => (
                    previous.refresh_token.clone(),
                    refresh_expires_at.or(previous.refresh_expires_at),
                ),
                None => (None, None),
            },
        };

        let record = StoredTokenRecord {
            app_id: app_id.to_string(),
            access_token: app.cipher.seal_str(&response.access_token)?,
            refresh_token,
            expires_at,
            refresh_expires_at,
            updated_at: now,
        };
        let token = AccessToken {
            token: response.access_token.clone(),
            expires_at,
        };

        Ok((record, token))
    }
}

/// `now + seconds`, or a rejection when the provider's lifetime does not fit a timestamp.
fn expiry_after(now: DateTime<Utc>, seconds: i64, field: &str) -> Result<DateTime<Utc>> {
    ChronoDuration::try_seconds(seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| AuthError::ProviderRejected {
            status: 200,
            error: format!("invalid_response: {} out of range", field),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{DerivedKey, SqliteTokenStore};
    use crate::handoff::HandoffError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// How the scripted operator answers one authorization request
    enum Reply {
        MatchingState(&'static str),
        WrongState(&'static str),
        NoState(&'static str),
        Fail(HandoffError),
    }

    #[derive(Default)]
    struct ScriptedCodes {
        replies: std::sync::Mutex<VecDeque<Reply>>,
        requests: std::sync::Mutex<Vec<AuthorizationRequest>>,
    }

    impl ScriptedCodes {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: std::sync::Mutex::new(replies.into()),
                requests: std::sync::Mutex::default(),
            })
        }

        fn requests(&self) -> Vec<AuthorizationRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AuthCodeProvider for ScriptedCodes {
        async fn await_code(
            &self,
            request: &AuthorizationRequest,
            timeout: Duration,
            _cancel: &CancellationToken,
        ) -> std::result::Result<AuthorizationCode, HandoffError> {
            self.requests.lock().unwrap().push(request.clone());
            let reply = self.replies.lock().unwrap().pop_front();
            let (code, state) = match reply {
                Some(Reply::MatchingState(code)) => (code, Some(request.state.clone())),
                Some(Reply::WrongState(code)) => (code, Some("forged".to_string())),
                Some(Reply::NoState(code)) => (code, None),
                Some(Reply::Fail(e)) => return Err(e),
                None => {
                    return Err(HandoffError::Timeout {
                        app_id: request.app_id.clone(),
                        timeout,
                    })
                }
            };
            Ok(AuthorizationCode {
                app_id: request.app_id.clone(),
                code: code.to_string(),
                state,
                received_at: Utc::now(),
            })
        }
    }

    fn app_config(token_url: String) -> AppCredentialConfig {
        AppCredentialConfig {
            id: "live".to_string(),
            client_id: "live-client".to_string(),
            client_secret: "live-secret".to_string(),
            auth_url: "https://example.com/authorize".to_string(),
            token_url,
            redirect_uri: "http://localhost/cb".to_string(),
            scopes: vec![],
            code_verifier: None,
        }
    }

    fn cipher() -> TokenCipher {
        TokenCipher::new(&DerivedKey::from_bytes([7u8; 32]))
    }

    fn settings() -> AuthSettings {
        AuthSettings {
            poll_interval_ms: 10,
            authorization_timeout_seconds: 5,
            http_timeout_seconds: 5,
            retry_backoff_ms: 1,
            ..AuthSettings::default()
        }
    }

    fn memory_store() -> Arc<SqliteTokenStore> {
        let store = SqliteTokenStore::open(":memory:").unwrap();
        store.ensure_schema().unwrap();
        Arc::new(store)
    }

    fn manager(
        server_url: &str,
        store: Arc<dyn TokenStore>,
        codes: Arc<dyn AuthCodeProvider>,
    ) -> TokenManager {
        TokenManager::new(settings(), store, codes)
            .unwrap()
            .with_app(app_config(format!("{}/token", server_url)), cipher())
    }

    fn seed(
        store: &dyn TokenStore,
        access: &str,
        expires_in: i64,
        refresh: Option<&str>,
    ) -> StoredTokenRecord {
        let cipher = cipher();
        let now = Utc::now();
        let record = StoredTokenRecord {
            app_id: "live".to_string(),
            access_token: cipher.seal_str(access).unwrap(),
            refresh_token: refresh.map(|r| cipher.seal_str(r).unwrap()),
            expires_at: now + ChronoDuration::seconds(expires_in),
            refresh_expires_at: None,
            updated_at: now,
        };
        store.upsert(&record).unwrap();
        record
    }

    #[tokio::test]
    async fn test_valid_stored_token_returned_without_calls() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/token").expect(0).create_async().await;
        let store = memory_store();
        seed(&*store, "cached", 3600, Some("rt"));
        let codes = ScriptedCodes::new(vec![]);

        let manager = manager(&server.url(), store, codes.clone());
        let token = manager.get_token("live").await.unwrap();

        assert_eq!(token.as_str(), "cached");
        assert!(codes.requests().is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unknown_app_is_configuration_error() {
        let server = mockito::Server::new_async().await;
        let manager = manager(&server.url(), memory_store(), ScriptedCodes::new(vec![]));

        let err = manager.get_token("nope").await.unwrap_err();
        assert!(matches!(err, AuthError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_expiring_token_refreshes_and_keeps_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::UrlEncoded(
                "refresh_token".into(),
                "my_refresh".into(),
            ))
            .with_status(200)
            .with_body(r#"{"access_token":"new_token","expires_in":1200}"#)
            .create_async()
            .await;
        let store = memory_store();
        seed(&*store, "old_token", 10, Some("my_refresh"));
        let codes = ScriptedCodes::new(vec![]);

        let manager = manager(&server.url(), store.clone(), codes.clone());
        let token = manager.get_token("live").await.unwrap();

        assert_eq!(token.as_str(), "new_token");
        assert!(codes.requests().is_empty());

        // Provider did not rotate: original refresh token must be kept
        let stored = store.get("live").unwrap().unwrap();
        let refresh = cipher().open_string(&stored.refresh_token.unwrap()).unwrap();
        assert_eq!(refresh, "my_refresh");
        assert_eq!(cipher().open_string(&stored.access_token).unwrap(), "new_token");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_replaces_old_one() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(
                r#"{"access_token":"new_token","refresh_token":"rotated","expires_in":1200,"refresh_token_expires_in":7200}"#,
            )
            .create_async()
            .await;
        let store = memory_store();
        seed(&*store, "old_token", -5, Some("my_refresh"));

        let manager = manager(&server.url(), store.clone(), ScriptedCodes::new(vec![]));
        manager.get_token("live").await.unwrap();

        let stored = store.get("live").unwrap().unwrap();
        let refresh = cipher().open_string(&stored.refresh_token.unwrap()).unwrap();
        assert_eq!(refresh, "rotated");
        assert!(stored.refresh_expires_at.is_some());
    }

    #[tokio::test]
    async fn test_fresh_authorization_stores_sealed_record() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::UrlEncoded("code".into(), "ABC123".into()))
            .with_status(200)
            .with_body(r#"{"access_token":"fresh","refresh_token":"rt","expires_in":1200}"#)
            .create_async()
            .await;
        let store = memory_store();
        let codes = ScriptedCodes::new(vec![Reply::MatchingState("ABC123")]);

        let manager = manager(&server.url(), store.clone(), codes.clone());
        let token = manager.get_token("live").await.unwrap();
        assert_eq!(token.as_str(), "fresh");

        let requests = codes.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].url.contains("client_id=live-client"));
        assert!(requests[0].url.contains(&format!("state={}", requests[0].state)));

        let stored = store.get("live").unwrap().unwrap();
        assert_ne!(stored.access_token, b"fresh".to_vec());
        assert_eq!(cipher().open_string(&stored.access_token).unwrap(), "fresh");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_state_mismatch_skips_endpoint_and_issues_new_state() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::UrlEncoded("code".into(), "GOOD".into()))
            .with_status(200)
            .with_body(r#"{"access_token":"fresh","expires_in":1200}"#)
            .expect(1)
            .create_async()
            .await;
        let codes = ScriptedCodes::new(vec![
            Reply::WrongState("FORGED"),
            Reply::MatchingState("GOOD"),
        ]);

        let manager = manager(&server.url(), memory_store(), codes.clone());
        let token = manager.get_token("live").await.unwrap();
        assert_eq!(token.as_str(), "fresh");

        let requests = codes.requests();
        assert_eq!(requests.len(), 2);
        assert_ne!(requests[0].state, requests[1].state);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_repeated_state_mismatch_gives_up() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/token").expect(0).create_async().await;
        let codes = ScriptedCodes::new(vec![
            Reply::WrongState("A"),
            Reply::WrongState("B"),
            Reply::WrongState("C"),
            Reply::WrongState("D"),
        ]);

        let manager = manager(&server.url(), memory_store(), codes.clone());
        let err = manager.get_token("live").await.unwrap_err();

        assert!(matches!(err, AuthError::AuthorizationState { .. }));
        assert_eq!(codes.requests().len(), 3);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_bare_code_without_state_is_accepted() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"fresh","expires_in":1200}"#)
            .create_async()
            .await;

        let manager = manager(
            &server.url(),
            memory_store(),
            ScriptedCodes::new(vec![Reply::NoState("BARE")]),
        );
        assert_eq!(manager.get_token("live").await.unwrap().as_str(), "fresh");
    }

    #[tokio::test]
    async fn test_corrupted_access_token_goes_to_authorization() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::UrlEncoded(
                "grant_type".into(),
                "authorization_code".into(),
            ))
            .with_status(200)
            .with_body(r#"{"access_token":"fresh","expires_in":1200}"#)
            .expect(1)
            .create_async()
            .await;
        let store = memory_store();
        let mut record = seed(&*store, "cached", 3600, Some("rt"));
        let last = record.access_token.len() - 1;
        record.access_token[last] ^= 0x01;
        store.upsert(&record).unwrap();
        let codes = ScriptedCodes::new(vec![Reply::MatchingState("CODE")]);

        let manager = manager(&server.url(), store, codes.clone());
        assert_eq!(manager.get_token("live").await.unwrap().as_str(), "fresh");
        assert_eq!(codes.requests().len(), 1);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_refresh_clears_token_then_authorizes() {
        let mut server = mockito::Server::new_async().await;
        let refresh_mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::UrlEncoded(
                "grant_type".into(),
                "refresh_token".into(),
            ))
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .expect(1)
            .create_async()
            .await;
        let exchange_mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::UrlEncoded(
                "grant_type".into(),
                "authorization_code".into(),
            ))
            .with_status(200)
            .with_body(r#"{"access_token":"fresh","expires_in":1200}"#)
            .create_async()
            .await;
        let store = memory_store();
        seed(&*store, "old", -60, Some("dead_refresh"));
        let codes = ScriptedCodes::new(vec![Reply::MatchingState("CODE")]);

        let manager = manager(&server.url(), store.clone(), codes.clone());
        assert_eq!(manager.get_token("live").await.unwrap().as_str(), "fresh");
        assert_eq!(codes.requests().len(), 1);
        assert_eq!(store.get("live").unwrap().unwrap().refresh_token, None);

        refresh_mock.assert_async().await;
        exchange_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_refresh_token_is_not_sent() {
        let mut server = mockito::Server::new_async().await;
        let refresh_mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::UrlEncoded(
                "grant_type".into(),
                "refresh_token".into(),
            ))
            .expect(0)
            .create_async()
            .await;
        let _exchange = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::UrlEncoded(
                "grant_type".into(),
                "authorization_code".into(),
            ))
            .with_status(200)
            .with_body(r#"{"access_token":"fresh","expires_in":1200}"#)
            .create_async()
            .await;
        let store = memory_store();
        let mut record = seed(&*store, "old", -60, Some("rt"));
        // Inside the one-hour refresh margin
        record.refresh_expires_at = Some(Utc::now() + ChronoDuration::minutes(30));
        store.upsert(&record).unwrap();

        let manager = manager(
            &server.url(),
            store,
            ScriptedCodes::new(vec![Reply::MatchingState("CODE")]),
        );
        assert_eq!(manager.get_token("live").await.unwrap().as_str(), "fresh");

        refresh_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_retries() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;
        let store = memory_store();
        seed(&*store, "old", -60, Some("rt"));
        let codes = ScriptedCodes::new(vec![]);

        let manager = manager(&server.url(), store.clone(), codes.clone());
        let err = manager.get_token("live").await.unwrap_err();

        assert!(matches!(err, AuthError::ProviderTransient(_)));
        assert!(codes.requests().is_empty());
        // Refresh token survives a transient outage
        assert!(store.get("live").unwrap().unwrap().refresh_token.is_some());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_invalid_grant_on_exchange_reauthorizes() {
        let mut server = mockito::Server::new_async().await;
        let bad = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::UrlEncoded("code".into(), "USED".into()))
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .expect(1)
            .create_async()
            .await;
        let good = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::UrlEncoded("code".into(), "NEW".into()))
            .with_status(200)
            .with_body(r#"{"access_token":"fresh","expires_in":1200}"#)
            .expect(1)
            .create_async()
            .await;
        let codes = ScriptedCodes::new(vec![
            Reply::MatchingState("USED"),
            Reply::MatchingState("NEW"),
        ]);

        let manager = manager(&server.url(), memory_store(), codes.clone());
        assert_eq!(manager.get_token("live").await.unwrap().as_str(), "fresh");
        assert_eq!(codes.requests().len(), 2);

        bad.assert_async().await;
        good.assert_async().await;
    }

    #[tokio::test]
    async fn test_other_rejection_on_exchange_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_client"}"#)
            .create_async()
            .await;
        let codes = ScriptedCodes::new(vec![Reply::MatchingState("CODE")]);

        let manager = manager(&server.url(), memory_store(), codes.clone());
        let err = manager.get_token("live").await.unwrap_err();

        assert!(matches!(err, AuthError::ProviderRejected { status: 400, .. }));
        assert_eq!(codes.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_lifetime_is_rejected_not_stored() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"fresh","expires_in":1000000000000000}"#)
            .create_async()
            .await;
        let store = memory_store();
        let codes = ScriptedCodes::new(vec![Reply::MatchingState("CODE")]);

        let manager = manager(&server.url(), store.clone(), codes);
        match manager.get_token("live").await {
            Err(AuthError::ProviderRejected { status, error }) => {
                assert_eq!(status, 200);
                assert!(error.contains("expires_in out of range"));
            }
            other => panic!("expected ProviderRejected, got {:?}", other),
        }
        assert!(store.get("live").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_refresh_lifetime_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(
                r#"{"access_token":"fresh","refresh_token":"rt","expires_in":1200,"refresh_token_expires_in":9223372036854775807}"#,
            )
            .create_async()
            .await;
        let codes = ScriptedCodes::new(vec![Reply::MatchingState("CODE")]);

        let manager = manager(&server.url(), memory_store(), codes);
        let err = manager.get_token("live").await.unwrap_err();
        assert!(
            matches!(&err, AuthError::ProviderRejected { error, .. } if error.contains("refresh_token_expires_in"))
        );
    }

    #[tokio::test]
    async fn test_negative_lifetime_treated_as_expiring() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"short-lived","refresh_token":"rt","expires_in":-30,"refresh_token_expires_in":-1}"#)
            .create_async()
            .await;
        let store = memory_store();
        let codes = ScriptedCodes::new(vec![Reply::MatchingState("CODE")]);
        let before = Utc::now();

        let manager = manager(&server.url(), store.clone(), codes);
        let token = manager.get_token("live").await.unwrap();

        assert_eq!(token.as_str(), "short-lived");
        assert!(token.expires_at >= before);
        assert!(token.expires_at <= Utc::now());
        let stored = store.get("live").unwrap().unwrap();
        assert!(stored.refresh_expires_at.unwrap() <= Utc::now());
    }

    #[tokio::test]
    async fn test_matching_code_late_in_wait_is_accepted() {
        struct Forward(tokio::sync::mpsc::UnboundedSender<AuthorizationRequest>);

        impl crate::handoff::AuthorizationNotifier for Forward {
            fn notify(&self, request: &AuthorizationRequest, _mailbox: &std::path::Path) {
                let _ = self.0.send(request.clone());
            }
        }

        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::UrlEncoded("code".into(), "GOOD".into()))
            .with_status(200)
            .with_body(r#"{"access_token":"fresh","expires_in":1200}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (tx, mut prompts) = tokio::sync::mpsc::unbounded_channel();
        let mailbox = crate::handoff::FileMailbox::new(dir.path(), Duration::from_millis(500))
            .with_notifier(Arc::new(Forward(tx)));
        let settings = AuthSettings {
            poll_interval_ms: 500,
            authorization_timeout_seconds: 1,
            ..settings()
        };
        let manager = Arc::new(
            TokenManager::new(settings, memory_store(), Arc::new(mailbox.clone()))
                .unwrap()
                .with_app(app_config(format!("{}/token", server.url())), cipher()),
        );

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.get_token("live").await }
        });
        let request = prompts.recv().await.unwrap();

        // Read on the tick at the wait's deadline, after the state was issued
        tokio::time::sleep(Duration::from_millis(600)).await;
        mailbox
            .submit("live", &format!("https://h/cb?code=GOOD&state={}", request.state))
            .unwrap();

        let token = pending.await.unwrap().unwrap();
        assert_eq!(token.as_str(), "fresh");
        assert!(prompts.try_recv().is_err());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_handoff_timeout_surfaces() {
        let server = mockito::Server::new_async().await;
        let store = memory_store();
        let manager = manager(&server.url(), store.clone(), ScriptedCodes::new(vec![]));

        let err = manager.get_token("live").await.unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationTimeout { .. }));
        assert!(store.get("live").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_denied_redirect_surfaces() {
        let server = mockito::Server::new_async().await;
        let codes = ScriptedCodes::new(vec![Reply::Fail(HandoffError::Denied {
            error: "access_denied".to_string(),
            description: None,
        })]);

        let manager = manager(&server.url(), memory_store(), codes);
        let err = manager.get_token("live").await.unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationDenied { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let server = mockito::Server::new_async().await;
        let manager = manager(&server.url(), memory_store(), ScriptedCodes::new(vec![]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = manager
            .get_token_with_cancel("live", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
    }

    /// Simulates another process writing a fresh token while this one refreshes
    struct RacingStore {
        inner: Arc<SqliteTokenStore>,
        raced: std::sync::atomic::AtomicBool,
    }

    impl TokenStore for RacingStore {
        fn ensure_schema(&self) -> anyhow::Result<()> {
            self.inner.ensure_schema()
        }

        fn get(&self, app_id: &str) -> anyhow::Result<Option<StoredTokenRecord>> {
            self.inner.get(app_id)
        }

        fn upsert(&self, record: &StoredTokenRecord) -> anyhow::Result<()> {
            self.inner.upsert(record)
        }

        fn replace_if_unchanged(
            &self,
            record: &StoredTokenRecord,
            expected_updated_at: DateTime<Utc>,
        ) -> anyhow::Result<bool> {
            if !self.raced.swap(true, std::sync::atomic::Ordering::SeqCst) {
                seed(&*self.inner, "from_other_process", 3600, Some("other_rt"));
            }
            self.inner.replace_if_unchanged(record, expected_updated_at)
        }

        fn clear_refresh_token(
            &self,
            app_id: &str,
            expected_updated_at: DateTime<Utc>,
        ) -> anyhow::Result<bool> {
            self.inner.clear_refresh_token(app_id, expected_updated_at)
        }

        fn delete(&self, app_id: &str) -> anyhow::Result<bool> {
            self.inner.delete(app_id)
        }

        fn list_app_ids(&self) -> anyhow::Result<Vec<String>> {
            self.inner.list_app_ids()
        }
    }

    #[tokio::test]
    async fn test_lost_refresh_race_rereads_record() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"mine","expires_in":1200}"#)
            .expect(1)
            .create_async()
            .await;
        let inner = memory_store();
        seed(&*inner, "old", -60, Some("rt"));
        // Make sure the racing write gets a later updated_at
        tokio::time::sleep(Duration::from_millis(5)).await;
        let store = Arc::new(RacingStore {
            inner: inner.clone(),
            raced: Default::default(),
        });

        let manager = manager(&server.url(), store, ScriptedCodes::new(vec![]));
        let token = manager.get_token("live").await.unwrap();

        assert_eq!(token.as_str(), "from_other_process");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_revoke_deletes_record() {
        let server = mockito::Server::new_async().await;
        let store = memory_store();
        seed(&*store, "cached", 3600, None);

        let manager = manager(&server.url(), store.clone(), ScriptedCodes::new(vec![]));
        assert!(manager.revoke("live").await.unwrap());
        assert!(!manager.revoke("live").await.unwrap());
        assert!(store.get("live").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_from_config_derives_working_ciphers() {
        let dir = tempfile::tempdir().unwrap();
        let server = mockito::Server::new_async().await;
        let mut config = AuthServiceConfig::default();
        config.secrets.base_path = dir.path().to_path_buf();
        config.apps.push(app_config(format!("{}/token", server.url())));

        let manager = TokenManager::from_config(
            &config,
            memory_store(),
            ScriptedCodes::new(vec![]),
        )
        .unwrap();

        assert_eq!(manager.app_ids(), vec!["live".to_string()]);
        assert!(config.secrets.salt_path().exists());
    }
}
