//! Logging configuration for the SPV wallet.
//!
//! Console output through `tracing-subscriber`, honoring `RUST_LOG` when
//! no explicit level is given. Log files and rotation belong to the
//! embedding application.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Initialize console logging at the given level.
///
/// Returns an error message when a subscriber is already installed.
pub fn init_console_logging(level: LevelFilter) -> Result<(), String> {
    let filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| e.to_string())
}

/// Parse a level name as accepted on the command line.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    match name.to_ascii_lowercase().as_str() {
        "error" => Some(LevelFilter::ERROR),
        "warn" => Some(LevelFilter::WARN),
        "info" => Some(LevelFilter::INFO),
        "debug" => Some(LevelFilter::DEBUG),
        "trace" => Some(LevelFilter::TRACE),
        _ => None,
    }
}
