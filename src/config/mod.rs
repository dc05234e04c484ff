use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable pointing at the configuration file.
pub const CONFIG_PATH_ENV: &str = "SAXO_AUTH_CONFIG";

/// Used when neither `--config` nor `SAXO_AUTH_CONFIG` is given.
pub const DEFAULT_CONFIG_PATH: &str = "./config/config.toml";

/// Complete configuration shared by both executables
#[derive(Debug, Clone, Deserialize)]
pub struct AuthServiceConfig {
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub apps: Vec<AppCredentialConfig>,
}

/// OAuth client registration for one application.
///
/// Immutable after load. The `id` doubles as the token store key and
/// as the prefix of the authorization-code mailbox file.
#[derive(Clone, Deserialize)]
pub struct AppCredentialConfig {
    pub id: String,
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// PKCE verifier forwarded on code exchange when the app registration requires it
    #[serde(default)]
    pub code_verifier: Option<String>,
}

impl std::fmt::Debug for AppCredentialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppCredentialConfig")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("code_verifier", &self.code_verifier.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Filesystem locations for secrets
#[derive(Debug, Clone, Deserialize)]
pub struct SecretsConfig {
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    /// Directory holding the authorization-code mailboxes
    #[serde(default)]
    pub tokens_path: Option<PathBuf>,
    #[serde(default)]
    pub salt_file: Option<PathBuf>,
}

fn default_base_path() -> PathBuf {
    PathBuf::from("./secrets")
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            tokens_path: None,
            salt_file: None,
        }
    }
}

impl SecretsConfig {
    pub fn token_dir(&self) -> PathBuf {
        self.tokens_path
            .clone()
            .unwrap_or_else(|| self.base_path.join("saxo_tokens"))
    }

    pub fn salt_path(&self) -> PathBuf {
        self.salt_file
            .clone()
            .unwrap_or_else(|| self.base_path.join("encryption.salt"))
    }
}

/// Token database configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DatabaseConfig {
    /// SQLite file; defaults to `{secrets.base_path}/tokens.db`
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Timing and retry knobs for the OAuth flow
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    /// How often the mailbox is checked while waiting for the operator
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_authorization_timeout_seconds")]
    pub authorization_timeout_seconds: u64,
    /// Per-request timeout for token endpoint calls
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    /// Access tokens this close to expiry are treated as expired
    #[serde(default = "default_expiry_margin_seconds")]
    pub expiry_margin_seconds: i64,
    /// Refresh tokens this close to expiry are not used
    #[serde(default = "default_refresh_expiry_margin_seconds")]
    pub refresh_expiry_margin_seconds: i64,
    #[serde(default = "default_max_provider_attempts")]
    pub max_provider_attempts: u32,
    /// First retry delay; doubled on each further attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_authorization_attempts")]
    pub max_authorization_attempts: u32,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_authorization_timeout_seconds() -> u64 {
    120
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_expiry_margin_seconds() -> i64 {
    60
}

fn default_refresh_expiry_margin_seconds() -> i64 {
    3600
}

fn default_max_provider_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_authorization_attempts() -> u32 {
    3
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            authorization_timeout_seconds: default_authorization_timeout_seconds(),
            http_timeout_seconds: default_http_timeout_seconds(),
            expiry_margin_seconds: default_expiry_margin_seconds(),
            refresh_expiry_margin_seconds: default_refresh_expiry_margin_seconds(),
            max_provider_attempts: default_max_provider_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_authorization_attempts: default_max_authorization_attempts(),
        }
    }
}

impl AuthSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn authorization_timeout(&self) -> Duration {
        Duration::from_secs(self.authorization_timeout_seconds)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Rejects values that would stall the flow or overflow time arithmetic.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("auth.poll_interval_ms", as_i64(self.poll_interval_ms), 1, 60_000)?;
        check_range(
            "auth.authorization_timeout_seconds",
            as_i64(self.authorization_timeout_seconds),
            1,
            86_400,
        )?;
        check_range("auth.http_timeout_seconds", as_i64(self.http_timeout_seconds), 1, 3_600)?;
        check_range("auth.expiry_margin_seconds", self.expiry_margin_seconds, 0, 86_400)?;
        check_range(
            "auth.refresh_expiry_margin_seconds",
            self.refresh_expiry_margin_seconds,
            0,
            30 * 86_400,
        )?;
        check_range("auth.retry_backoff_ms", as_i64(self.retry_backoff_ms), 0, 60_000)?;
        check_range(
            "auth.max_provider_attempts",
            i64::from(self.max_provider_attempts),
            1,
            10,
        )?;
        check_range(
            "auth.max_authorization_attempts",
            i64::from(self.max_authorization_attempts),
            1,
            10,
        )?;
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for AuthServiceConfig {
    fn default() -> Self {
        Self {
            secrets: SecretsConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthSettings::default(),
            logging: LoggingConfig::default(),
            apps: Vec::new(),
        }
    }
}

/// Configuration problems detected at load time
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("app '{app}': {field} must not be empty")]
    MissingField { app: String, field: &'static str },

    #[error("app '{0}' is configured more than once")]
    DuplicateApp(String),

    #[error("no app named '{0}' in configuration")]
    UnknownApp(String),

    #[error("no apps configured")]
    NoApps,

    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
}

fn check_range(field: &'static str, value: i64, min: i64, max: i64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

fn as_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl AuthServiceConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| self.secrets.base_path.join("tokens.db"))
    }

    /// Looks up an app by id, or the first configured app when `id` is None.
    pub fn app(&self, id: Option<&str>) -> Result<&AppCredentialConfig, ConfigError> {
        match id {
            Some(id) => self
                .apps
                .iter()
                .find(|app| app.id == id)
                .ok_or_else(|| ConfigError::UnknownApp(id.to_string())),
            None => self.apps.first().ok_or(ConfigError::NoApps),
        }
    }

    /// Checks required fields once so call sites never re-validate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for app in &self.apps {
            app.validate()?;
            if !seen.insert(app.id.as_str()) {
                return Err(ConfigError::DuplicateApp(app.id.clone()));
            }
        }

        self.auth.validate()
    }
}

impl AppCredentialConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("id", &self.id),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("auth_url", &self.auth_url),
            ("token_url", &self.token_url),
            ("redirect_uri", &self.redirect_uri),
        ];

        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    app: self.id.clone(),
                    field,
                });
            }
        }

        Ok(())
    }
}

/// Resolves the config path: explicit flag, then env var, then default.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load and validate configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AuthServiceConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: AuthServiceConfig =
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    config.validate()?;
    Ok(config)
}
