//! tracing-subscriber setup for the binary.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Installs the global subscriber. `RUST_LOG` overrides the configured
/// filter; `verbose` raises this crate to `debug`.
///
/// Logs go to stderr so that stdout stays usable for job output.
pub fn init(config: &LoggingConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = if verbose {
            format!("{},codeloop=debug", config.filter)
        } else {
            config.filter.clone()
        };
        EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    // A subscriber may already be installed (tests, embedding); keep it.
    let _ = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
