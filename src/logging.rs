use std::env;
use tracing_subscriber::EnvFilter;

/// Stdout logging filtered by the `TRACING_LEVEL` environment variable
/// (default `info`). Safe to call more than once; only the first call
/// installs a subscriber, so tests can invoke it per-case.
pub fn init_logger() {
    let filter = env::var("TRACING_LEVEL").unwrap_or_else(|_| "info".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_file(false)
        .without_time()
        .try_init();
}
