//! Tracing output for the `warren` binary and tests.

use tracing::Level;

/// Overrides the level handed to [`init`], e.g. `WARREN_LOG=debug`.
pub const LOG_ENV: &str = "WARREN_LOG";

/// Level for a name such as `warn` or `TRACE`. Unknown names give `None`.
pub fn parse_level(name: &str) -> Option<Level> {
    match name.trim().to_ascii_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// `WARREN_LOG` if it names a level, else `default_level`, else `info`.
pub fn resolve_level(default_level: &str) -> Level {
    std::env::var(LOG_ENV)
        .ok()
        .and_then(|name| parse_level(&name))
        .or_else(|| parse_level(default_level))
        .unwrap_or(Level::INFO)
}

/// Installs the global subscriber. Uses `try_init`, so calling this more
/// than once is harmless.
pub fn init(default_level: &str) {
    let level = resolve_level(default_level);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}
