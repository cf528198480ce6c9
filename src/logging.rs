//! Structured logging (§2.1): a human-compact layer for foreground/interactive
//! runs, a JSON layer once daemonized, and — added as soon as the state
//! directory is known, always before daemonization — a file-backed "wrapper
//! log" layer distinct from the converter's own logs.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable compact output, for a foreground/interactive run.
    Human,
    /// Structured JSON output, for a daemonized run.
    Json,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("v2v_wrapper=info,warn"))
}

/// Build the global subscriber. `wrapper_log` is `Some` once the state
/// directory has been computed (§4.7 `STATE_CREATED`); its writer guard must
/// be kept alive for the process lifetime, so the caller holds it.
///
/// Call exactly once, before any other `tracing` call.
pub fn init(format: LogFormat, wrapper_log: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match wrapper_log {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(env_filter()).with(file_layer);

    // stdout is reserved for the single startup JSON object (§6); all logging
    // goes to stderr.
    match format {
        LogFormat::Human => {
            let console = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_writer(std::io::stderr)
                .compact();
            registry.with(console).init();
        }
        LogFormat::Json => {
            let console = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_writer(std::io::stderr);
            registry.with(console).init();
        }
    }

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_equality() {
        assert_eq!(LogFormat::Human, LogFormat::Human);
        assert_eq!(LogFormat::Json, LogFormat::Json);
        assert_ne!(LogFormat::Human, LogFormat::Json);
    }
}
