use crate::paths::LogPaths;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Timestamps in the `[2024-01-31 12:00:00 UTC]` form used by the log files.
#[derive(Clone, Copy, Debug, Default)]
pub struct UtcTimestamp;

impl FormatTime for UtcTimestamp {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

/// Backend log files. Everything goes to the log file; warnings and errors
/// are duplicated into the error file.
pub struct BackendLogger {
    log_file: File,
    error_file: File,
}

impl BackendLogger {
    pub fn open(paths: &LogPaths) -> Result<Self, String> {
        if let Some(parent) = paths.backend_logs.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create log directory: {}", e))?;
        }

        Ok(Self {
            log_file: open_append(&paths.backend_logs)?,
            error_file: open_append(&paths.backend_errors)?,
        })
    }
}

fn open_append(path: &Path) -> Result<File, String> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("Cannot write to log file {}: {}", path.display(), e))
}

/// Install the global subscriber: stderr output filtered by `RUST_LOG` (or
/// `default_level`), plus the backend log files when given.
pub fn init(default_level: &str, files: Option<BackendLogger>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))?;

    let stderr_layer = fmt::layer()
        .with_timer(UtcTimestamp)
        .with_target(false)
        .with_writer(std::io::stderr);

    let file_layer = files.map(|logger| {
        let all = Mutex::new(logger.log_file);
        let errors = Mutex::new(logger.error_file).with_max_level(Level::WARN);
        fmt::layer()
            .with_timer(UtcTimestamp)
            .with_ansi(false)
            .with_writer(all.and(errors))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!("[logging] Backend logger initialized");
    Ok(())
}
