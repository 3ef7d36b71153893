//! Logging setup for edgetun.
//!
//! Structured logging through `tracing`, written to stdout and optionally to
//! a daily rolling file. Records emitted through the `log` crate are bridged
//! into `tracing`.

use tracing::Level;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

/// Log initialization options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Log level (default: INFO)
    pub level: Level,

    /// Whether to log to stdout (default: true)
    pub log_to_stdout: bool,

    /// Whether to log to a file (default: false)
    pub log_to_file: bool,

    /// Directory to store log files (default: "./logs")
    pub log_dir: String,

    /// Base filename for log files (default: "edgetun")
    pub log_file_name: String,

    /// Whether to use JSON format for logs (default: false)
    pub json_format: bool,

    /// Whether to include file and line information (default: false)
    pub include_file_line: bool,

    /// Whether to log span open/close events (default: false)
    pub include_span_events: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: Level::INFO,
            log_to_stdout: true,
            log_to_file: false,
            log_dir: "./logs".to_string(),
            log_file_name: "edgetun".to_string(),
            json_format: false,
            include_file_line: false,
            include_span_events: false,
        }
    }
}

/// Parse a level name such as `"debug"`. Case-insensitive.
pub fn parse_level(name: &str) -> Option<Level> {
    match name.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Initialize logging with the given options.
///
/// Returns a guard that must be kept alive for the duration of the program
/// to ensure file logs are flushed.
///
/// # Examples
///
/// ```
/// use shared_utils::logging::{init_logging, LogOptions};
/// use tracing::Level;
///
/// let _guard = init_logging(LogOptions {
///     level: Level::DEBUG,
///     ..Default::default()
/// });
/// ```
pub fn init_logging(options: LogOptions) -> Option<WorkerGuard> {
    let _ = LogTracer::init();

    let filter = EnvFilter::from_default_env().add_directive(options.level.into());
    let span_events = if options.include_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let mut layers = Vec::new();
    let mut guard = None;

    if options.log_to_stdout {
        let stdout_layer = fmt::layer()
            .with_file(options.include_file_line)
            .with_line_number(options.include_file_line)
            .with_target(true)
            .with_span_events(span_events.clone());

        let stdout_layer = if options.json_format {
            stdout_layer.json().boxed()
        } else {
            stdout_layer.boxed()
        };

        layers.push(stdout_layer);
    }

    if options.log_to_file {
        let file_appender =
            RollingFileAppender::new(Rotation::DAILY, &options.log_dir, &options.log_file_name);

        let (non_blocking, worker_guard) = NonBlocking::new(file_appender);
        guard = Some(worker_guard);

        let file_layer = fmt::layer()
            .with_file(options.include_file_line)
            .with_line_number(options.include_file_line)
            .with_target(true)
            .with_ansi(false)
            .with_span_events(span_events)
            .with_writer(non_blocking);

        let file_layer = if options.json_format {
            file_layer.json().boxed()
        } else {
            file_layer.boxed()
        };

        layers.push(file_layer);
    }

    // Ignore if a subscriber is already set in this process
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init();

    guard
}

impl LogOptions {
    /// Options for the configured `log_level`, adding a rolling file sink
    /// when `log_dir` is set.
    pub fn from_config(config: &crate::config::Config) -> Self {
        let mut options = LogOptions {
            level: parse_level(&config.log_level).unwrap_or(Level::INFO),
            ..Default::default()
        };
        if let Some(dir) = &config.log_dir {
            options.log_to_file = true;
            options.log_dir = dir.to_string_lossy().into_owned();
        }
        options
    }
}
