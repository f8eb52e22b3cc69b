use std::env;
use tracing::Level;
use tracing_subscriber::EnvFilter;

fn level_from_env() -> Level {
    env::var("LOG_LEVEL")
        .map(|level| match level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO)
}

/// Installs a stderr subscriber at the level named by `LOG_LEVEL` (default info).
///
/// `RUST_LOG` directives still apply on top. Fails if a global subscriber is already set.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level_from_env().into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init()
}
