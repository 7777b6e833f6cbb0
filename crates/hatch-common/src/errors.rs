//! Error types for the hatch process-spawn engine.
//!
//! The taxonomy separates failures by where they occur relative to process
//! creation:
//!
//! - [`SpawnError::Configuration`]: a malformed launch request. Raised
//!   before any OS resource is touched; always recoverable by the caller.
//! - [`SpawnError::Resource`]: the OS refused an action needed to build the
//!   launch plan in the parent (pipe, fork). No child was created.
//! - [`SpawnError::Launch`]: child-side setup failed after the fork but
//!   before the point of no return; the parent reaps the dead child and
//!   reports this exactly as if creation itself had failed.
//! - [`SpawnError::Wait`]: misuse of a process handle (double reap, wait on
//!   a vanished child).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for spawn operations.
pub type SpawnResult<T> = std::result::Result<T, SpawnError>;

/// Main error type for the spawn engine.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// Malformed launch request. Raised by pure validation, before any
    /// process exists.
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Parent-side OS failure while preparing the launch (creating the
    /// error pipe, forking). The child was never created.
    #[error("Resource error during {op}: {source}")]
    Resource {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Child-side setup or exec failure, relayed to the parent over the
    /// launch error pipe. The child has already been reaped when this is
    /// returned; no zombie or orphan is left behind.
    #[error("Launch failed at {step}: {kind} (errno {errno})")]
    Launch {
        step: ChildStep,
        kind: ErrorKind,
        errno: i32,
    },

    /// Waiting misuse: the handle was already reaped, or the child vanished.
    #[error("Wait error for pid {pid}: {reason}")]
    Wait { pid: i32, reason: WaitErrorReason },
}

impl SpawnError {
    /// Creates a Configuration error.
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Creates a Resource error from an I/O error.
    pub fn resource(op: &'static str, source: std::io::Error) -> Self {
        Self::Resource { op, source }
    }

    /// Creates a Launch error from a child step and raw errno.
    pub fn launch(step: ChildStep, errno: i32) -> Self {
        Self::Launch {
            step,
            kind: ErrorKind::from_errno(errno),
            errno,
        }
    }

    /// Creates a Wait error for an already-reaped handle.
    pub fn already_reaped(pid: i32) -> Self {
        Self::Wait {
            pid,
            reason: WaitErrorReason::AlreadyReaped,
        }
    }

    /// Creates a Wait error for a child unknown to the OS.
    pub fn no_such_child(pid: i32) -> Self {
        Self::Wait {
            pid,
            reason: WaitErrorReason::NoSuchChild,
        }
    }

    /// The classified error kind, where one applies.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Launch { kind, .. } => Some(*kind),
            Self::Resource { source, .. } => {
                source.raw_os_error().map(ErrorKind::from_errno)
            }
            _ => None,
        }
    }
}

/// Why a wait call was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitErrorReason {
    /// The handle already delivered a terminal status; reaping twice is an
    /// error, not a cached replay.
    AlreadyReaped,
    /// The OS does not know the pid as a child of this process.
    NoSuchChild,
}

impl std::fmt::Display for WaitErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyReaped => write!(f, "status already reaped"),
            Self::NoSuchChild => write!(f, "no such child"),
        }
    }
}

/// OS error classified by kind, so callers match on a taxonomy instead of a
/// raw errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    TooManyOpenFiles,
    InvalidArgument,
    BadDescriptor,
    Other,
}

impl ErrorKind {
    /// Classify a raw errno value.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT | libc::ESRCH => Self::NotFound,
            libc::EACCES | libc::EPERM => Self::PermissionDenied,
            libc::EMFILE | libc::ENFILE => Self::TooManyOpenFiles,
            libc::EINVAL => Self::InvalidArgument,
            libc::EBADF => Self::BadDescriptor,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::PermissionDenied => "permission denied",
            Self::TooManyOpenFiles => "too many open files",
            Self::InvalidArgument => "invalid argument",
            Self::BadDescriptor => "bad descriptor",
            Self::Other => "os error",
        };
        f.write_str(s)
    }
}

/// Which child-side setup step failed, in the order the child applies them.
///
/// Encoded as a single byte on the launch error pipe, so the discriminants
/// are part of the parent/child wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChildStep {
    Pgroup = 1,
    Rlimit = 2,
    Chdir = 3,
    Umask = 4,
    Redirect = 5,
    Exec = 6,
}

impl ChildStep {
    /// Decode a wire byte back into a step. Unknown bytes map to `Exec`
    /// (the last step) rather than failing the error path itself.
    pub fn from_wire(byte: u8) -> Self {
        match byte {
            1 => Self::Pgroup,
            2 => Self::Rlimit,
            3 => Self::Chdir,
            4 => Self::Umask,
            5 => Self::Redirect,
            _ => Self::Exec,
        }
    }
}

impl std::fmt::Display for ChildStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pgroup => "process-group setup",
            Self::Rlimit => "resource-limit setup",
            Self::Chdir => "working-directory change",
            Self::Umask => "umask change",
            Self::Redirect => "descriptor redirection",
            Self::Exec => "exec",
        };
        f.write_str(s)
    }
}
