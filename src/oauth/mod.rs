//! OAuth2 authorization-code flow.
//!
//! [`TokenManager`] drives each app from "no credential" to a valid access
//! token:
//!
//! ```text
//! NoToken ──▶ AwaitingAuthorization ──▶ ExchangingCode ──▶ Valid
//!                   ▲      │ state mismatch                  ▲
//!                   │      └──────────┘ (fresh state)        │
//!                   │                                        │
//!                   └──── rejected ── RefreshingToken ◀── NeedsRefresh
//! ```
//!
//! Plaintext tokens exist only inside the manager and in the [`AccessToken`]
//! handed to the caller; the store sees sealed bytes.
//!
//! [`AccessToken`]: crate::credentials::AccessToken

mod exchange;
mod manager;
mod provider;
mod state_manager;

pub use exchange::{ProviderClient, ProviderError, TokenResponse, INVALID_GRANT};
pub use manager::TokenManager;
pub use provider::build_authorization_url;
pub use state_manager::StateManager;

use std::fmt;

/// Lifecycle state of one app's credential during a `get_token` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowState {
    NoToken,
    AwaitingAuthorization,
    ExchangingCode,
    Valid,
    NeedsRefresh,
    RefreshingToken,
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowState::NoToken => "no_token",
            FlowState::AwaitingAuthorization => "awaiting_authorization",
            FlowState::ExchangingCode => "exchanging_code",
            FlowState::Valid => "valid",
            FlowState::NeedsRefresh => "needs_refresh",
            FlowState::RefreshingToken => "refreshing_token",
        };
        f.write_str(name)
    }
}
