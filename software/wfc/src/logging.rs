use std::{
    fs::{self, File, OpenOptions},
    path::Path,
    sync::{Mutex, OnceLock},
};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

type FileLayer = fmt::Layer<
    Registry,
    fmt::format::DefaultFields,
    fmt::format::Format<fmt::format::Full, fmt::time::ChronoUtc>,
    NonBlocking,
>;

/// Global root logger.
static LOGGING_GUARDS: OnceLock<LoggingGuards> = OnceLock::new();

/// Logger thread handle, which must be kept alive for as long as the logfile will be used.
/// Flushed automatically when dropped.
struct LoggingGuards {
    file: Mutex<Option<WorkerGuard>>,

    /// A handle to point the file logger at a different file, or nowhere.
    file_reload: reload::Handle<Option<FileLayer>, Registry>,
}

impl LoggingGuards {
    /// Point the file logger at a different file, or disable it.
    /// Anything buffered for the previous file is flushed first.
    fn update_file_layer(&self, logfile: Option<File>) -> Result<(), String> {
        let (file_layer, file_guard) = match logfile {
            Some(f) => {
                let (file_writer, file_guard) = tracing_appender::non_blocking(f);
                (Some(build_file_layer(file_writer)), Some(file_guard))
            }
            None => (None, None),
        };

        let mut guard = self
            .file
            .lock()
            .map_err(|_| "Logging file guard lock poisoned".to_string())?;

        self.file_reload
            .modify(|layer| {
                *layer = file_layer;
            })
            .map_err(|e| format!("Failed to reload logging file layer: {e}"))?;

        // Dropping the old guard flushes the old file
        *guard = file_guard;
        Ok(())
    }
}

/// Build a formatted file logger on top of a thread-safe nonblocking writer.
fn build_file_layer(file_writer: NonBlocking) -> FileLayer {
    fmt::layer::<Registry>()
        .with_timer(fmt::time::ChronoUtc::rfc_3339())
        .with_writer(file_writer)
        .with_ansi(false)
}

/// Open a logfile for appending, creating it and its directory if needed.
fn open_logfile(path: &Path) -> Result<File, String> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|e| format!("Failed to create log directory: {e}"))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("Failed to open log file {}: {e}", path.display()))
}

/// Send log records to `logfile`, appending to it if it exists.
///
/// Logging is process-global. Later calls redirect the records to a new file,
/// and `None` switches file logging off again, flushing the previous file.
/// Passing `None` before any logfile has been set up installs nothing.
/// The level defaults to `info` and can be set with `RUST_LOG`.
pub fn init_logging(logfile: Option<&Path>) -> Result<(), String> {
    let logfile = logfile.map(open_logfile).transpose()?;

    // If we're already initialized, just update the file logger to point at the new file
    if let Some(guards) = LOGGING_GUARDS.get() {
        return guards.update_file_layer(logfile);
    }
    let Some(logfile) = logfile else {
        return Ok(());
    };

    let (file_writer, file_guard) = tracing_appender::non_blocking(logfile);

    // Filter for log level
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| format!("Failed to set up logging env filter: {e}"))?;

    // Build file logger (with formatting) from writer
    let file_layer = Some(build_file_layer(file_writer));
    let (file_layer, file_reload) = reload::Layer::<Option<FileLayer>, Registry>::new(file_layer);

    // Set up global root logger
    tracing_subscriber::registry()
        .with(file_layer)
        .with(env_filter)
        .try_init()
        .map_err(|e| format!("Failed to initialize logging: {e}"))?;

    let guards = LoggingGuards {
        file: Mutex::new(Some(file_guard)),
        file_reload,
    };
    LOGGING_GUARDS
        .set(guards)
        .map_err(|_| "Logging was initialized concurrently".to_string())
}
