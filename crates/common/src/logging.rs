//! Tracing setup for the driver daemon

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set. Otherwise a bare `default_level` such as
/// `"debug"` applies to the driver crates and `warn` to their dependencies;
/// a string with explicit directives is used as the filter verbatim.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => EnvFilter::try_new(driver_directives(default_level)).map_err(|e| {
            crate::Error::Config(format!("invalid log filter {:?}: {}", default_level, e))
        })?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();

    Ok(())
}

fn driver_directives(level: &str) -> String {
    if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("warn,common={level},storage={level},usbstord={level}")
    }
}
