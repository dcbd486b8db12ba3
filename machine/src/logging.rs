//! Tracing subscriber setup.

use std::path::PathBuf;

use machine_shared::errors::{MachineError, MachineResult};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Where and how to log.
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Directory for daily-rotated log files. Logs go to stderr when unset.
    pub log_dir: Option<PathBuf>,
    pub file_name: String,
    /// Filter used when `RUST_LOG` is not set.
    pub default_filter: String,
    pub ansi: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            log_dir: None,
            file_name: "machine.log".to_string(),
            default_filter: "info".to_string(),
            ansi: true,
        }
    }
}

fn env_filter(default_filter: &str) -> MachineResult<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| MachineError::Config(format!("invalid log filter '{}': {}", default_filter, e)))
}

/// Install the global subscriber.
///
/// With a log directory, returns the guard that keeps the background writer
/// alive; dropping it flushes and stops file logging. A second call is a
/// no-op.
pub fn init_logging(options: LoggingOptions) -> MachineResult<Option<WorkerGuard>> {
    let filter = env_filter(&options.default_filter)?;

    match options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir).map_err(|e| {
                MachineError::Storage(format!(
                    "Failed to create log directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;

            let file_appender = tracing_appender::rolling::daily(dir, &options.file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(non_blocking)
                        .with_target(true)
                        .with_thread_ids(false)
                        .with_file(false)
                        .with_line_number(false)
                        .with_ansi(false),
                )
                .try_init();

            Ok(Some(guard))
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true)
                        .with_ansi(options.ansi),
                )
                .try_init();

            Ok(None)
        }
    }
}
