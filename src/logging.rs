//! Diagnostic output for the `dsense` binary.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the filter directive, e.g. `dirsense=debug`.
pub const LOG_ENV: &str = "DSENSE_LOG";

fn filter_from(directive: Option<String>) -> EnvFilter {
    directive
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Install the global subscriber. Logs go to stderr so stdout stays
/// parseable. Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let filter = filter_from(std::env::var(LOG_ENV).ok());
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .with(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_directive_falls_back_to_info() {
        let filter = filter_from(Some("dirsense=notalevel".to_string()));
        assert_eq!(filter.to_string(), "info");
        assert_eq!(filter_from(None).to_string(), "info");
    }
}
