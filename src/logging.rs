//! Log output for the binaries.
//!
//! Events are written to stderr as timestamped, levelled lines. The filter
//! comes from the `--log-level` flag, then the `BENCHVM_LOG` environment
//! variable, then `info`.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Environment variable holding a default log filter.
pub const LOG_ENV: &str = "BENCHVM_LOG";

/// Filter applied when nothing else is configured.
pub const DEFAULT_FILTER: &str = "info";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The filter directive could not be parsed.
    #[error("invalid log filter '{directive}': {message}")]
    Filter {
        /// Directive as given.
        directive: String,
        /// Parser error.
        message: String,
    },
    /// A global subscriber was already installed.
    #[error("logging already initialised: {0}")]
    Install(String),
}

/// Picks the filter directive: explicit level, `--verbose`, the
/// environment, then [`DEFAULT_FILTER`].
#[must_use]
pub fn resolve_directive(level: Option<&str>, verbose: bool, env: Option<&str>) -> String {
    level
        .or_else(|| verbose.then_some("debug"))
        .or(env)
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .unwrap_or(DEFAULT_FILTER)
        .to_owned()
}

/// Builds the filter for `directive`.
///
/// # Errors
///
/// Returns [`LoggingError::Filter`] when `directive` is not a valid filter.
pub fn filter(directive: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_new(directive).map_err(|err| LoggingError::Filter {
        directive: directive.to_owned(),
        message: err.to_string(),
    })
}

/// Installs the global stderr subscriber.
///
/// # Errors
///
/// Returns [`LoggingError`] when the filter is invalid or a subscriber is
/// already installed.
pub fn init(level: Option<&str>, verbose: bool) -> Result<(), LoggingError> {
    let env = std::env::var(LOG_ENV).ok();
    let directive = resolve_directive(level, verbose, env.as_deref());
    tracing_subscriber::fmt()
        .with_env_filter(filter(&directive)?)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| LoggingError::Install(err.to_string()))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Some("warn"), true, Some("trace"), "warn")]
    #[case(None, true, Some("trace"), "debug")]
    #[case(None, false, Some("benchvm=trace"), "benchvm=trace")]
    #[case(None, false, Some("  "), "info")]
    #[case(None, false, None, "info")]
    fn directive_precedence(
        #[case] level: Option<&str>,
        #[case] verbose: bool,
        #[case] env: Option<&str>,
        #[case] expected: &str,
    ) {
        assert_eq!(resolve_directive(level, verbose, env), expected);
    }

    #[test]
    fn invalid_filter_is_reported() {
        let err = filter("benchvm=loud").expect_err("invalid directive");
        assert!(err.to_string().starts_with("invalid log filter 'benchvm=loud'"));
    }
}
