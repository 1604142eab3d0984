//! Shared utilities: the crate's error types and logging setup.

pub mod error;
pub mod logging;

#[cfg(test)]
mod tests {
    use super::logging::{self, LOG_ENV, parse_level, resolve_level};
    use serial_test::serial;
    use tracing::Level;

    #[test]
    fn parse_level_is_case_insensitive() {
        assert_eq!(parse_level("WARN"), Some(Level::WARN));
        assert_eq!(parse_level(" warning "), Some(Level::WARN));
        assert_eq!(parse_level("trace"), Some(Level::TRACE));
        assert_eq!(parse_level("nonsense"), None);
    }

    #[test]
    #[serial]
    fn environment_overrides_cli_level() {
        temp_env::with_var(LOG_ENV, Some("debug"), || {
            assert_eq!(resolve_level("error"), Level::DEBUG);
        });
        temp_env::with_var(LOG_ENV, Some("loud"), || {
            assert_eq!(resolve_level("error"), Level::ERROR);
        });
        temp_env::with_var(LOG_ENV, None::<&str>, || {
            assert_eq!(resolve_level("nonsense"), Level::INFO);
        });
    }

    #[test]
    #[serial]
    fn logging_init_can_run_twice() {
        logging::init("info");
        logging::init("debug");
    }
}
