//! # Logging
//!
//! Structured logging via `tracing`. Connection events carry the engine's
//! trace identifier as a field so one connection's lines can be filtered out
//! of a busy server log.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogLevel, LoggingConfig};

/// Install the global subscriber.
///
/// Filter precedence: `RUST_LOG`, then `verbose` (debug), then `level`.
/// Calling this twice is harmless; the second subscriber is discarded.
pub fn init_logging(level: LogLevel, verbose: bool, config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(level, verbose)))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_ansi(config.enable_colors)
        .with_line_number(config.include_file_line)
        .with_file(config.include_file_line);

    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
    {
        tracing::debug!(level = %level, verbose, "Logging initialized");
    }
    Ok(())
}

fn default_directive(level: LogLevel, verbose: bool) -> String {
    let level = if verbose && level > LogLevel::Debug {
        LogLevel::Debug
    } else {
        level
    };
    level.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_lowers_to_debug() {
        assert_eq!(default_directive(LogLevel::Info, true), "debug");
        assert_eq!(default_directive(LogLevel::Trace, true), "trace");
        assert_eq!(default_directive(LogLevel::Warn, false), "warn");
    }

    #[test]
    fn test_init_twice_is_ok() {
        let config = LoggingConfig::default();
        assert!(init_logging(LogLevel::Info, false, &config).is_ok());
        assert!(init_logging(LogLevel::Debug, false, &config).is_ok());
    }
}
