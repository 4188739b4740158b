//! Tracing setup for the relay
//!
//! The long-running agent logs to a daily-rotating file in the XDG state
//! directory (`~/.local/state/activity-relay/`). One-off commands asked to be
//! verbose log to stderr instead, so their output lands next to the command.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Transport crates that are chatty at debug level
const QUIET_TARGETS: &[&str] = &[
    "tungstenite",
    "tokio_tungstenite",
    "hyper",
    "hyper_util",
    "reqwest",
    "rustls",
];

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSink {
    /// Rotating file under the state directory
    File,
    /// Standard error, for interactive commands
    Stderr,
}

/// Guard that keeps the non-blocking writer alive
///
/// When dropped, flushes any pending log writes.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init(config: &LoggingConfig, sink: LogSink) -> Result<LoggingGuard> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(directives(&config.level)).map_err(|e| {
            Error::Config(format!("invalid logging.level {:?}: {}", config.level, e))
        })?,
    };

    let guard = match sink {
        LogSink::File => {
            let log_dir = Config::state_dir();
            std::fs::create_dir_all(&log_dir)?;

            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("activity-relay")
                .filename_suffix("log")
                .max_log_files(config.max_files.max(1))
                .build(&log_dir)
                .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true),
                )
                .try_init()
                .map_err(|e| Error::Config(format!("failed to install subscriber: {}", e)))?;

            tracing::info!(
                log_dir = %log_dir.display(),
                level = %config.level,
                max_files = config.max_files,
                "Logging to file"
            );
            guard
        }
        LogSink::Stderr => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(writer).with_target(false))
                .try_init()
                .map_err(|e| Error::Config(format!("failed to install subscriber: {}", e)))?;
            guard
        }
    };

    Ok(LoggingGuard { _guard: guard })
}

/// Initialize logging for tests (logs to stdout)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Filter directives for `level`, with transport internals held at warn.
fn directives(level: &str) -> String {
    let mut out = level.trim().to_string();
    for target in QUIET_TARGETS {
        out.push_str(&format!(",{}=warn", target));
    }
    out
}
