//! Logging infrastructure for the DRM agent.
//!
//! Translates the `log_*` keys of the configuration file into a `tracing`
//! subscriber with a console layer and an optional non-blocking file layer.
//! The host application calls [`init`] once, before constructing the agent,
//! and keeps the returned guard alive; the agent itself only emits `tracing`
//! events.

use crate::config::Settings;
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Guard that must be kept alive for the duration of logging.
///
/// Dropping this guard flushes and closes the log file writer.
#[derive(Debug)]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Map a numeric verbosity (0 trace .. 5 critical, 6 off) to a level filter.
fn level_filter(verbosity: i32) -> LevelFilter {
    match verbosity {
        i32::MIN..=0 => LevelFilter::TRACE,
        1 => LevelFilter::DEBUG,
        2 => LevelFilter::INFO,
        3 => LevelFilter::WARN,
        4 | 5 => LevelFilter::ERROR,
        _ => LevelFilter::OFF,
    }
}

/// Initialize the logging system from the agent settings.
///
/// Sets up a console layer at `log_verbosity` and, when `log_file_type` is
/// non-zero, a file layer at `log_file_verbosity` writing to
/// `log_file_path` (type 1 appends to a single file, type 2 rotates daily).
///
/// # Errors
///
/// Returns an error if a file layer is requested without a path, or if the
/// log directory cannot be created.
pub fn init(settings: &Settings) -> Result<LoggingGuard, io::Error> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_filter(level_filter(settings.log_verbosity));

    let mut file_guard = None;
    let file_layer = if settings.log_file_type != 0 {
        let path = settings.log_file_path.as_deref().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "log_file_path is required when log_file_type is non-zero",
            )
        })?;
        let path = std::path::Path::new(path);
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "log_file_path has no file name"))?;
        std::fs::create_dir_all(dir)?;

        let appender = if settings.log_file_type >= 2 {
            tracing_appender::rolling::daily(dir, file_name)
        } else {
            tracing_appender::rolling::never(dir, file_name)
        };
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(level_filter(settings.log_file_verbosity)),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
