//! Authorization URL construction.

use crate::config::AppCredentialConfig;

/// Build the browser authorization URL for `app` carrying `state`.
///
/// `scope` is omitted when the app has no scopes configured (the trading
/// provider grants its default scope in that case).
pub fn build_authorization_url(app: &AppCredentialConfig, state: &str) -> String {
    let mut url = format!(
        "{}{}response_type=code&client_id={}&redirect_uri={}",
        app.auth_url,
        if app.auth_url.contains('?') { '&' } else { '?' },
        urlencoding::encode(&app.client_id),
        urlencoding::encode(&app.redirect_uri),
    );

    if !app.scopes.is_empty() {
        let scopes = app.scopes.join(" ");
        url.push_str("&scope=");
        url.push_str(&urlencoding::encode(&scopes));
    }

    url.push_str("&state=");
    url.push_str(&urlencoding::encode(state));
    url
}
