//! Tracing subscriber setup for the daemon.

use crate::config::LogConfig;
use guestvisor_shared::{GuestvisorError, GuestvisorResult};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "guestvisord.log";

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. When a log directory is set the
/// output goes to a daily-rolling file through a non-blocking writer; the
/// returned guard must be kept alive for buffered lines to be flushed.
pub fn init_logging(config: &LogConfig) -> GuestvisorResult<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| GuestvisorError::Config(format!("invalid log level: {}", e)))?;

    match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .try_init()
                .map_err(|e| GuestvisorError::Internal(format!("init logging: {}", e)))?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_ansi(config.ansi)
                .try_init()
                .map_err(|e| GuestvisorError::Internal(format!("init logging: {}", e)))?;
            Ok(None)
        }
    }
}
