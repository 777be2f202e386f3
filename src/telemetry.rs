//! Tracing infrastructure.
//!
//! Structured, async-aware logging via `tracing` and `tracing-subscriber`. Filtering
//! comes from `RUST_LOG` when set, otherwise from the configured log level, so a
//! deployment can tighten or loosen output without a rebuild.

use tracing_subscriber::EnvFilter;

use crate::error::{DeviceError, Result};
use crate::settings::Settings;

/// Initialize the global tracing subscriber from settings.
///
/// Safe to call once per process; a second call reports an error rather than
/// panicking, so tests that share a process can ignore it.
pub fn init(settings: &Settings) -> Result<()> {
    init_with_level(&settings.log_level)
}

/// Initialize the global tracing subscriber with an explicit default level.
pub fn init_with_level(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| DeviceError::Internal(format!("tracing init failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_init_is_an_error_not_a_panic() {
        // Whichever call goes first wins; the second must fail cleanly.
        let first = init_with_level("info");
        let second = init_with_level("debug");
        assert!(first.is_ok() || second.is_err());
    }
}
