use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Installs the process-wide tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level`. Must be called once, by the
/// binary entry point; a second call fails because a global subscriber is
/// already set.
pub fn init(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| Error::Config(format!("invalid log level `{}`: {}", level, e)))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialised: {}", e)))
}
