use anyhow::{Context, Result};
use clap::Parser;
use saxo_auth::config::{load_config, resolve_config_path};
use saxo_auth::credentials::{SqliteTokenStore, TokenStore};
use saxo_auth::handoff::FileMailbox;
use saxo_auth::TokenManager;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Print a valid access token for a configured app, authorizing if needed.
#[derive(Parser, Debug)]
#[command(name = "saxo-get-token", version)]
struct Args {
    /// App id from the config file (defaults to the first configured app)
    app_id: Option<String>,

    /// Path to the TOML config (falls back to $SAXO_AUTH_CONFIG, then ./config/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Delete the stored token record and exit
    #[arg(long)]
    revoke: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config.as_deref());
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    saxo_auth::logging::init(&config.logging.level);

    let app_id = config.app(args.app_id.as_deref())?.id.clone();
    info!(app_id = %app_id, config = %config_path.display(), "saxo-get-token starting");

    let db_path = config.database_path();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = SqliteTokenStore::open(&db_path).context("Failed to open token store")?;
    store.ensure_schema().context("Failed to initialize token store")?;

    let mailbox = FileMailbox::new(config.secrets.token_dir(), config.auth.poll_interval());
    let manager = TokenManager::from_config(&config, Arc::new(store), Arc::new(mailbox))?;

    if args.revoke {
        let deleted = manager.revoke(&app_id).await?;
        eprintln!(
            "{}",
            if deleted {
                format!("Revoked stored token for app '{}'", app_id)
            } else {
                format!("No stored token for app '{}'", app_id)
            }
        );
        return Ok(());
    }

    // Ctrl-C abandons the operator wait without leaving partial state
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    match manager.get_token_with_cancel(&app_id, &cancel).await {
        Ok(token) => {
            println!("{}", token.as_str());
            Ok(())
        }
        Err(e) => {
            error!(app_id = %app_id, error = %e, "Failed to obtain access token");
            Err(e.into())
        }
    }
}
