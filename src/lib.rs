// Configuration loading and validation
pub mod config;

// Salt, key derivation, sealing and token persistence
pub mod credentials;

// Error taxonomy
pub mod error;

// Out-of-band authorization code hand-off
pub mod handoff;

// Process-wide tracing setup for the binaries
pub mod logging;

// OAuth2 authorization-code flow
pub mod oauth;

pub use config::{AppCredentialConfig, AuthServiceConfig};
pub use credentials::AccessToken;
pub use error::{AuthError, Result};
pub use oauth::TokenManager;
