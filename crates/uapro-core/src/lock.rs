//! Host-wide operation lock.
//!
//! Long-running operations (`refresh`, release-upgrade processing) must not
//! overlap on one machine. The lock is a single file holding
//! `"<pid>:<operation>"`.
//!
//! # Invariants
//!
//! - At most one lock file exists; it is created with a no-clobber rename so
//!   two racing processes cannot both win.
//! - A lock file is only honoured while its pid is alive. A dead pid or an
//!   unparsable record (truncated write) is cleared and acquisition retried
//!   once.
//! - The holder releases the lock by dropping [`HostLock`], on every exit
//!   path including unwinding.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::fs_safe::{self, CreateOutcome};
use crate::messages;

/// Errors from lock operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockError {
    /// A live process holds the lock.
    #[error("{msg}")]
    Held {
        /// Formatted user-facing message naming the holder.
        msg: String,
        /// Holder record.
        holder: LockRecord,
    },

    /// Lost the creation race twice in a row.
    #[error("lock file {path} keeps reappearing; another operation is starting")]
    Contended {
        /// Lock file path.
        path: PathBuf,
    },

    /// I/O error on the lock file.
    #[error("lock I/O error: {context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        source: io::Error,
    },
}

impl LockError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    /// Process holding the lock.
    pub pid: u32,
    /// Operation name, e.g. `"uapro refresh"`.
    pub operation: String,
}

impl LockRecord {
    /// Parse `"<pid>:<operation>"`. Returns `None` for anything else.
    #[must_use]
    pub fn parse(content: &str) -> Option<Self> {
        let (pid, operation) = content.trim().split_once(':')?;
        let pid = pid.trim().parse::<u32>().ok()?;
        let operation = operation.trim();
        if operation.is_empty() {
            return None;
        }
        Some(Self {
            pid,
            operation: operation.to_string(),
        })
    }
}

impl fmt::Display for LockRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pid, self.operation)
    }
}

/// What is currently at the lock path.
enum Observed {
    Missing,
    Live(LockRecord),
    Stale(Option<LockRecord>),
}

/// Acquires the host lock.
#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
}

impl LockManager {
    /// Manage the lock at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock for `operation` on behalf of the current process.
    ///
    /// # Errors
    ///
    /// - [`LockError::Held`] if a live process holds the lock; the message
    ///   names `operation` as the refused verb and the holder's operation and
    ///   pid.
    /// - [`LockError::Contended`] if the lock reappeared after a stale record
    ///   was cleared.
    /// - [`LockError::Io`] on filesystem errors.
    pub fn acquire(&self, operation: &str) -> Result<HostLock, LockError> {
        let record = LockRecord {
            pid: std::process::id(),
            operation: operation.to_string(),
        };

        for attempt in 0..2 {
            match fs_safe::create_new(&self.path, record.to_string().as_bytes(), 0o600)
                .map_err(|e| LockError::io(format!("creating lock file {}", self.path.display()), e))?
            {
                CreateOutcome::Created => {
                    debug!(path = %self.path.display(), operation, "acquired host lock");
                    return Ok(HostLock {
                        path: self.path.clone(),
                        record,
                    });
                },
                CreateOutcome::AlreadyExists => {},
            }

            match self.observe()? {
                Observed::Missing => {},
                Observed::Live(holder) => {
                    return Err(LockError::Held {
                        msg: messages::lock_held(operation, &holder.operation, holder.pid),
                        holder,
                    });
                },
                Observed::Stale(previous) => {
                    warn!(
                        path = %self.path.display(),
                        previous = ?previous,
                        attempt,
                        "clearing stale host lock"
                    );
                    fs_safe::remove_if_exists(&self.path).map_err(|e| {
                        LockError::io(format!("removing stale lock {}", self.path.display()), e)
                    })?;
                },
            }
        }

        Err(LockError::Contended {
            path: self.path.clone(),
        })
    }

    /// The live holder of the lock, if any. Stale records are ignored but not
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Io`] if the lock file exists but cannot be read.
    pub fn holder(&self) -> Result<Option<LockRecord>, LockError> {
        Ok(match self.observe()? {
            Observed::Live(record) => Some(record),
            Observed::Missing | Observed::Stale(_) => None,
        })
    }

    fn observe(&self) -> Result<Observed, LockError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Observed::Missing),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => return Ok(Observed::Stale(None)),
            Err(e) => {
                return Err(LockError::io(
                    format!("reading lock file {}", self.path.display()),
                    e,
                ));
            },
        };
        Ok(match LockRecord::parse(&content) {
            Some(record) if is_pid_alive(record.pid) => Observed::Live(record),
            other => Observed::Stale(other),
        })
    }
}

/// Held host lock. Dropping it removes the lock file.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct HostLock {
    path: PathBuf,
    record: LockRecord,
}

impl HostLock {
    /// The record written to the lock file.
    pub const fn record(&self) -> &LockRecord {
        &self.record
    }
}

impl Drop for HostLock {
    fn drop(&mut self) {
        match fs_safe::remove_if_exists(&self.path) {
            Ok(_) => debug!(path = %self.path.display(), operation = %self.record.operation, "released host lock"),
            Err(e) => warn!(path = %self.path.display(), err = %e, "failed to remove host lock"),
        }
    }
}

/// Check whether a given PID is alive.
///
/// Uses `kill(pid, 0)`, which checks for existence without sending a signal.
fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs only the existence and permission check.
        #[allow(unsafe_code)]
        let result = unsafe { libc::kill(pid_i32, 0) };
        if result == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to someone else.
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid_i32;
        true
    }
}
