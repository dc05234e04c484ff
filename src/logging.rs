use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber, writing to stderr.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies. Stdout is left
/// alone so `saxo-get-token` can print nothing but the token.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // A second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
