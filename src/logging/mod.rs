use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::info;
use tracing_subscriber::{fmt::MakeWriter, prelude::*, EnvFilter};

pub const LOG_FILTER_ENV: &str = "LYRICS_LOG";
const DEFAULT_LOG_FILTER: &str = "info,lyrics_guess=debug";
const MAX_LOG_FILE_BYTES: u64 = 5 * 1024 * 1024;

static INSTALLED: Mutex<Option<LoggingState>> = Mutex::new(None);

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory `{}`: {source}", path.display())]
    CreateDirectory { path: PathBuf, source: io::Error },
    #[error("failed to inspect log file `{}`: {source}", path.display())]
    Inspect { path: PathBuf, source: io::Error },
    #[error("failed to truncate oversized log file `{}`: {source}", path.display())]
    Truncate { path: PathBuf, source: io::Error },
    #[error("failed to open log file `{}`: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to read log file `{}`: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to install log subscriber: {0}")]
    Install(String),
}

#[derive(Debug, Clone)]
pub struct LoggingState {
    log_file_path: Arc<PathBuf>,
}

impl LoggingState {
    pub fn new(log_file_path: PathBuf) -> Self {
        Self {
            log_file_path: Arc::new(log_file_path),
        }
    }

    pub fn log_file_path(&self) -> &Path {
        self.log_file_path.as_ref().as_path()
    }

    /// Whole log file as text, for attaching to bug reports.
    pub fn export_contents(&self) -> Result<String, LoggingError> {
        read_log_file(self.log_file_path())
    }
}

/// Installs the global subscriber: a plain-text file layer plus stderr.
///
/// Fails with `LoggingError::Install` if a subscriber is already set; use
/// `ensure_initialized` when several sessions may share a process.
///
/// The filter comes from `LYRICS_LOG`, then `RUST_LOG`, then the built-in default.
pub fn initialize(log_file_path: &Path) -> Result<LoggingState, LoggingError> {
    let log_file = open_log_file(log_file_path)?;
    let writer = SharedLogWriterFactory::new(log_file);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_level(true)
                .with_writer(writer),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_writer(std::io::stderr),
        );

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|error| LoggingError::Install(error.to_string()))?;

    info!(log_file = %log_file_path.display(), "diagnostic logging initialized");
    Ok(LoggingState::new(log_file_path.to_path_buf()))
}

/// Installs logging once per process; later calls return the first state.
pub fn ensure_initialized(log_file_path: &Path) -> Result<LoggingState, LoggingError> {
    let mut installed = INSTALLED
        .lock()
        .map_err(|_| LoggingError::Install("logging state lock poisoned".to_string()))?;
    if let Some(state) = installed.as_ref() {
        return Ok(state.clone());
    }

    let state = initialize(log_file_path)?;
    *installed = Some(state.clone());
    Ok(state)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_FILTER_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn open_log_file(log_file_path: &Path) -> Result<File, LoggingError> {
    if let Some(parent_dir) = log_file_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
    {
        fs::create_dir_all(parent_dir).map_err(|source| LoggingError::CreateDirectory {
            path: parent_dir.to_path_buf(),
            source,
        })?;
    }

    cap_log_file_size(log_file_path, MAX_LOG_FILE_BYTES)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path)
        .map_err(|source| LoggingError::Open {
            path: log_file_path.to_path_buf(),
            source,
        })
}

fn cap_log_file_size(log_file_path: &Path, max_bytes: u64) -> Result<(), LoggingError> {
    let metadata = match fs::metadata(log_file_path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(LoggingError::Inspect {
                path: log_file_path.to_path_buf(),
                source,
            })
        }
    };

    if metadata.len() <= max_bytes {
        return Ok(());
    }

    OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(log_file_path)
        .map_err(|source| LoggingError::Truncate {
            path: log_file_path.to_path_buf(),
            source,
        })?;

    Ok(())
}

fn read_log_file(log_file_path: &Path) -> Result<String, LoggingError> {
    let contents = match fs::read(log_file_path) {
        Ok(contents) => contents,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
        Err(source) => {
            return Err(LoggingError::Read {
                path: log_file_path.to_path_buf(),
                source,
            })
        }
    };

    Ok(String::from_utf8_lossy(&contents).into_owned())
}

#[derive(Debug, Clone)]
struct SharedLogWriterFactory {
    file: Arc<Mutex<File>>,
}

impl SharedLogWriterFactory {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl<'a> MakeWriter<'a> for SharedLogWriterFactory {
    type Writer = SharedLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SharedLogWriter {
            file: Arc::clone(&self.file),
        }
    }
}

struct SharedLogWriter {
    file: Arc<Mutex<File>>,
}

impl io::Write for SharedLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        file.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, io::Write, time::SystemTime};

    use tracing_subscriber::fmt::MakeWriter;

    use super::*;

    fn temp_log_path(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("clock should progress")
            .as_nanos();
        std::env::temp_dir().join(format!("{prefix}-{nanos}.log"))
    }

    #[test]
    fn capping_oversized_log_file_truncates_contents() {
        let path = temp_log_path("lyrics-log-cap");
        fs::write(&path, "x".repeat(1024)).expect("should write test log file");

        cap_log_file_size(&path, 128).expect("capping should succeed");

        let truncated = fs::read_to_string(&path).expect("should read truncated log file");
        assert!(truncated.is_empty());

        let _ = fs::remove_file(path);
    }

    #[test]
    fn small_log_file_is_left_alone() {
        let path = temp_log_path("lyrics-log-small");
        fs::write(&path, "kept").expect("should write test log file");

        cap_log_file_size(&path, 128).expect("capping should succeed");

        assert_eq!(fs::read_to_string(&path).expect("should read log"), "kept");
        let _ = fs::remove_file(path);
    }

    #[test]
    fn repeated_initialization_keeps_the_first_log_file() {
        let first = temp_log_path("lyrics-log-first");
        let second = temp_log_path("lyrics-log-second");

        let state = ensure_initialized(&first).expect("first initialization should succeed");
        let again = ensure_initialized(&second).expect("second initialization should reuse state");

        assert_eq!(again.log_file_path(), state.log_file_path());
        assert!(state.log_file_path().exists());
    }

    #[test]
    fn reading_missing_log_file_returns_empty_string() {
        let path = temp_log_path("lyrics-log-missing");

        let contents = read_log_file(&path).expect("reading missing log should succeed");
        assert!(contents.is_empty());
    }

    #[test]
    fn shared_writer_appends_to_the_log_file() {
        let path = temp_log_path("lyrics-log-writer");
        let file = open_log_file(&path).expect("log file should open");
        let factory = SharedLogWriterFactory::new(file);

        factory
            .make_writer()
            .write_all(b"first\n")
            .expect("write should succeed");
        factory
            .make_writer()
            .write_all(b"second\n")
            .expect("write should succeed");

        let state = LoggingState::new(path.clone());
        assert_eq!(
            state.export_contents().expect("log should be readable"),
            "first\nsecond\n"
        );
        let _ = fs::remove_file(path);
    }
}
