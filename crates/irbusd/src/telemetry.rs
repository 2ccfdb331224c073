//! Structured logging initialisation for the daemon.
//!
//! Logs go to stderr or, with `--logfile`, to a file behind a shared handle
//! that SIGHUP can reopen (log rotation moves the file aside; the daemon
//! then recreates it on the original path).

use std::fs::{File, OpenOptions};
use std::io::{self, IsTerminal, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::Utf8PathBuf;
use once_cell::sync::OnceCell;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use irbus_config::Config;

static TELEMETRY_GUARD: OnceCell<LogHandle> = OnceCell::new();

/// Errors encountered while configuring logging.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The configured level did not form a valid filter.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// The log file could not be opened.
    #[error("cannot open logfile '{path}': {source}")]
    Logfile {
        /// Configured log file path.
        path: Utf8PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The global subscriber could not be installed.
    #[error("failed to install logging subscriber: {0}")]
    Subscriber(#[from] SetGlobalDefaultError),
}

#[derive(Debug)]
enum LogSink {
    Stderr,
    File { path: Utf8PathBuf, file: File },
}

/// Cloneable handle to the active log sink.
#[derive(Debug, Clone)]
pub struct LogHandle {
    sink: Arc<Mutex<LogSink>>,
}

impl LogHandle {
    /// A handle writing to stderr; does not install any subscriber.
    #[must_use]
    pub fn stderr() -> Self {
        Self {
            sink: Arc::new(Mutex::new(LogSink::Stderr)),
        }
    }

    fn file(path: Utf8PathBuf) -> Result<Self, TelemetryError> {
        let file = open_log_file(&path)?;
        Ok(Self {
            sink: Arc::new(Mutex::new(LogSink::File { path, file })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LogSink> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reopens a file sink on its original path; a no-op for stderr.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error when the file cannot be recreated.
    pub fn reopen(&self) -> io::Result<()> {
        let mut sink = self.lock();
        if let LogSink::File { path, file } = &mut *sink {
            *file = OpenOptions::new().create(true).append(true).open(path.as_std_path())?;
        }
        Ok(())
    }
}

/// Writer handed to the subscriber for each event.
pub struct LogWriter<'a> {
    guard: MutexGuard<'a, LogSink>,
}

impl Write for LogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.guard {
            LogSink::Stderr => io::stderr().write(buf),
            LogSink::File { file, .. } => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.guard {
            LogSink::Stderr => io::stderr().flush(),
            LogSink::File { file, .. } => file.flush(),
        }
    }
}

impl<'a> fmt::MakeWriter<'a> for LogHandle {
    type Writer = LogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter { guard: self.lock() }
    }
}

/// Configures the global logging subscriber on first use.
///
/// Repeated calls return a handle to the already-installed sink without
/// touching global state again.
///
/// # Errors
///
/// Returns [`TelemetryError`] when the filter, log file or subscriber
/// installation fails.
pub fn init(config: &Config) -> Result<LogHandle, TelemetryError> {
    TELEMETRY_GUARD
        .get_or_try_init(|| install_subscriber(config))
        .cloned()
}

fn install_subscriber(config: &Config) -> Result<LogHandle, TelemetryError> {
    let filter = EnvFilter::try_new(config.loglevel.as_filter())
        .map_err(|error| TelemetryError::Filter(error.to_string()))?;

    let (handle, ansi) = match &config.logfile {
        Some(path) => (LogHandle::file(path.clone())?, false),
        None => (LogHandle::stderr(), io::stderr().is_terminal()),
    };

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(handle.clone())
        .with_ansi(ansi)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(handle)
}

fn open_log_file(path: &Utf8PathBuf) -> Result<File, TelemetryError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_std_path())
        .map_err(|source| TelemetryError::Logfile {
            path: path.clone(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use tracing_subscriber::fmt::MakeWriter;

    use super::*;

    #[test]
    fn file_sink_reopens_after_rotation() {
        let dir = tempdir().expect("tempdir");
        let path =
            Utf8PathBuf::from_path_buf(dir.path().join("irbusd.log")).expect("utf8 path");
        let handle = LogHandle::file(path.clone()).expect("file sink");

        {
            let mut writer = handle.make_writer();
            writer.write_all(b"before rotation\n").expect("write");
        }
        let rotated = dir.path().join("irbusd.log.1");
        std::fs::rename(path.as_std_path(), &rotated).expect("rotate");

        handle.reopen().expect("reopen");
        {
            let mut writer = handle.make_writer();
            writer.write_all(b"after rotation\n").expect("write");
        }

        assert_eq!(
            std::fs::read_to_string(&rotated).expect("old file"),
            "before rotation\n"
        );
        assert_eq!(
            std::fs::read_to_string(path.as_std_path()).expect("new file"),
            "after rotation\n"
        );
    }

    #[test]
    fn stderr_sink_reopen_is_a_noop() {
        let handle = LogHandle::stderr();
        handle.reopen().expect("reopen");
    }
}
