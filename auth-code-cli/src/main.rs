use anyhow::{bail, Context, Result};
use clap::Parser;
use saxo_auth::config::{load_config, resolve_config_path};
use saxo_auth::handoff::FileMailbox;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing::info;

/// Hand an authorization redirect URL (or bare code) to a waiting saxo-get-token.
#[derive(Parser, Debug)]
#[command(name = "saxo-submit-code", version)]
struct Args {
    /// App id from the config file (defaults to the first configured app)
    app_id: Option<String>,

    /// Path to the TOML config (falls back to $SAXO_AUTH_CONFIG, then ./config/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Redirect URL or code; read from stdin when omitted
    #[arg(long)]
    input: Option<String>,
}

/// Reads one line, prompting on stderr.
fn read_submission(app_id: &str, input: &mut impl BufRead, prompt: &mut impl Write) -> Result<String> {
    writeln!(
        prompt,
        "Paste the full redirect URL (or the code) for app '{}' and press Enter:",
        app_id
    )?;
    prompt.flush()?;

    let mut line = String::new();
    let read = input.read_line(&mut line).context("Failed to read from stdin")?;
    if read == 0 || line.trim().is_empty() {
        bail!("No input received");
    }
    Ok(line)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config.as_deref());
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    saxo_auth::logging::init(&config.logging.level);

    let app_id = config.app(args.app_id.as_deref())?.id.clone();

    let raw = match args.input {
        Some(input) => input,
        None => read_submission(
            &app_id,
            &mut std::io::stdin().lock(),
            &mut std::io::stderr(),
        )?,
    };

    let mailbox = FileMailbox::new(config.secrets.token_dir(), config.auth.poll_interval());
    let path = mailbox
        .submit(&app_id, &raw)
        .context("Failed to write authorization code")?;

    info!(app_id = %app_id, path = %path.display(), "Authorization code submitted");
    eprintln!("Authorization code for app '{}' written to {}", app_id, path.display());
    Ok(())
}
