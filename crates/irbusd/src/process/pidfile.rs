//! Unique process instance lock using a pidfile.
//!
//! The file holds ASCII `<pid>\n` under an exclusive advisory `flock` for
//! the daemon's lifetime. A second daemon finds the lock taken and reports
//! the owner's pid. After forking into the background the child re-writes
//! the file with its own pid; the lock survives the fork because it belongs
//! to the open file description.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use thiserror::Error;
use tracing::{info, warn};

use super::PROCESS_TARGET;

/// Errors acquiring the pidfile lock.
#[derive(Debug, Error)]
pub enum PidfileError {
    /// The pidfile could not be opened or created.
    #[error("can't open or create '{path}': {source}")]
    Create {
        /// Pidfile path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Another daemon instance holds the lock.
    #[error("there seems to already be a daemon process with pid {pid}")]
    LockedByOther {
        /// Pid read from the locked file.
        pid: u32,
    },
    /// The lock is taken but the file holds no parsable pid.
    #[error("invalid pidfile '{path}' encountered")]
    CantParse {
        /// Pidfile path.
        path: PathBuf,
    },
    /// The pid could not be written.
    #[error("cannot write pid to '{path}': {source}")]
    Write {
        /// Pidfile path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// The held pidfile lock. Dropping it removes the file.
#[derive(Debug)]
pub struct Pidfile {
    path: PathBuf,
    lock: Flock<File>,
}

impl Pidfile {
    /// Creates the pidfile, takes the exclusive lock and writes our pid.
    ///
    /// # Errors
    ///
    /// Returns [`PidfileError`] when the file cannot be created, is locked
    /// by another process, or cannot be written.
    pub fn lock(path: &Path) -> Result<Self, PidfileError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(path)
            .map_err(|source| PidfileError::Create {
                path: path.to_path_buf(),
                source,
            })?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                let mut pidfile = Self {
                    path: path.to_path_buf(),
                    lock,
                };
                pidfile
                    .update(std::process::id())
                    .map_err(|source| PidfileError::Write {
                        path: path.to_path_buf(),
                        source,
                    })?;
                info!(
                    target: PROCESS_TARGET,
                    path = %path.display(),
                    "acquired pidfile lock"
                );
                Ok(pidfile)
            }
            Err((mut file, _errno)) => {
                let mut content = String::new();
                let _ = file.read_to_string(&mut content);
                match content.trim().parse::<u32>() {
                    Ok(pid) => Err(PidfileError::LockedByOther { pid }),
                    Err(_) => Err(PidfileError::CantParse {
                        path: path.to_path_buf(),
                    }),
                }
            }
        }
    }

    /// Re-writes the file with `pid`; called again after daemonizing.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error.
    pub fn update(&mut self, pid: u32) -> io::Result<()> {
        let file: &mut File = &mut self.lock;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{pid}")?;
        let length = file.stream_position()?;
        file.set_len(length)?;
        file.flush()
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path)
            && error.kind() != io::ErrorKind::NotFound
        {
            warn!(
                target: PROCESS_TARGET,
                path = %self.path.display(),
                %error,
                "failed to remove pidfile"
            );
        }
    }
}
