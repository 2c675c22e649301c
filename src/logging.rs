//! `tracing` subscriber setup for the binary.
//!
//! The library only emits events; embedders install their own subscriber.
//! `RUST_LOG` wins over the built-in default filter.

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

use crate::constants::APP_NAME;

/// Install a `fmt` subscriber on stderr. In `debug-logs` builds every event
/// carries its `file:line`.
pub fn init(verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "info" };
        EnvFilter::new(format!("{APP_NAME}={level}"))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    #[cfg(feature = "debug-logs")]
    let builder = builder.with_file(true).with_line_number(true);

    builder
        .try_init()
        .map_err(|error| anyhow!("failed to initialize tracing subscriber: {error}"))
}
