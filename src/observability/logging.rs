//! # Structured Logging
//!
//! Logging setup using the tracing ecosystem. Format, output target and
//! level come from the command line and are fixed for the lifetime of the
//! process.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::errors::{AgentError, Result};

/// Human-readable output with ANSI colors.
pub const FORMAT_DEFAULT: &str = "default";
/// Human-readable output without colors.
pub const FORMAT_TEXT: &str = "text";
/// One JSON object per line.
pub const FORMAT_JSON: &str = "json";

pub const OUTPUT_STDERR: &str = "stderr";
pub const OUTPUT_STDOUT: &str = "stdout";

static LOGGING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Initialize logging. `output` is `stderr`, `stdout` or a file path.
pub fn init_logging(format: &str, output: &str, level: &str) -> Result<()> {
    let env_filter = parse_env_filter(level)?;

    LOGGING_INITIALIZED
        .get_or_try_init(|| configure_logging(format, output, env_filter))
        .map(|_| ())
}

fn configure_logging(format: &str, output: &str, env_filter: EnvFilter) -> Result<()> {
    let (writer, ansi) = match output {
        OUTPUT_STDERR => (BoxMakeWriter::new(std::io::stderr), true),
        OUTPUT_STDOUT => (BoxMakeWriter::new(std::io::stdout), true),
        path => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| {
                    AgentError::config_with_source(
                        format!("could not open log file '{}'", path),
                        Box::new(err),
                    )
                })?;
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
    };

    let registry = tracing_subscriber::registry().with(env_filter);

    let init_result = match format {
        FORMAT_JSON => registry
            .with(fmt::layer().json().flatten_event(true).with_writer(writer))
            .try_init(),
        FORMAT_TEXT => registry
            .with(fmt::layer().with_ansi(false).with_target(false).with_writer(writer))
            .try_init(),
        FORMAT_DEFAULT => registry
            .with(fmt::layer().with_ansi(ansi).with_writer(writer))
            .try_init(),
        other => {
            return Err(AgentError::config(format!(
                "Invalid log format '{}': must be one of {}, {}, {}",
                other, FORMAT_DEFAULT, FORMAT_TEXT, FORMAT_JSON
            )));
        }
    };

    init_result
        .map_err(|err| AgentError::config(format!("Failed to initialize logging: {}", err)))
}

fn parse_env_filter(level: &str) -> Result<EnvFilter> {
    let normalized = level.trim().to_ascii_lowercase();

    match normalized.as_str() {
        "debug" | "info" | "warn" | "error" => {}
        _ => {
            return Err(AgentError::config(format!(
                "Invalid log level '{}': must be one of debug, info, warn, error",
                level
            )));
        }
    }

    EnvFilter::try_new(normalized)
        .map_err(|err| AgentError::config(format!("Invalid log level '{}': {}", level, err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_log_level() {
        assert!(init_logging(FORMAT_DEFAULT, OUTPUT_STDERR, "verbose").is_err());
    }

    #[test]
    fn test_invalid_log_format() {
        assert!(configure_logging("yaml", OUTPUT_STDERR, EnvFilter::new("info")).is_err());
    }

    #[test]
    fn test_valid_levels_parse() {
        for level in ["debug", "info", "warn", "error", "  INFO  "] {
            assert!(parse_env_filter(level).is_ok(), "level {} should parse", level);
        }
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        // The first call may or may not win the global subscriber, depending
        // on test ordering; subsequent calls must not fail.
        let _ = init_logging(FORMAT_TEXT, OUTPUT_STDERR, "info");
        assert!(init_logging(FORMAT_TEXT, OUTPUT_STDERR, "info").is_ok());
    }
}
