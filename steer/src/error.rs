//! The runtime's error taxonomy.
//!
//! The core raises rich errors and propagates them with `?`; the process
//! boundary flattens each kind to a stable negative integer code whose text
//! form comes from [`error_message`]. Kinds, not sites, are stable: callers
//! may match on the variant, while the message carries the site detail.

use std::io;

use steer_communication::CommError;
use steer_shmem::ShmemError;

/// A specialized result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds raised by the runtime core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller-supplied name, domain, or vector was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An operation failed at run time.
    #[error("runtime error: {0}")]
    Runtime(String),
    /// An internal ordering or wiring invariant was violated.
    #[error("logic error: {0}")]
    Logic(String),
    /// A policy or configuration file could not be parsed.
    #[error("file parse error: {0}")]
    FileParse(String),
    /// A tree level index outside this node's range.
    #[error("level out of range: {0}")]
    LevelRange(String),
    /// A requested feature is recognized but not built.
    #[error("not implemented: {0}")]
    NotImplemented(String),
    /// A device or file transaction failed.
    #[error("io error on {path}: {source}")]
    Io {
        /// Device or file path involved in the failing transaction.
        path: String,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The application stopped advancing the control handshake.
    #[error("application stalled: {0}")]
    AppStalled(String),
}

/// Sentinel pseudo-code requesting usage text; maps to a zero exit code.
pub const ERROR_HELP: i32 = -4096;

impl Error {
    /// The stable negative code for this kind.
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => -1,
            Error::Runtime(_) => -2,
            Error::Logic(_) => -3,
            Error::FileParse(_) => -4,
            Error::LevelRange(_) => -5,
            Error::NotImplemented(_) => -6,
            Error::Io { .. } => -7,
            Error::AppStalled(_) => -8,
        }
    }

    pub(crate) fn io(path: impl Into<String>, source: io::Error) -> Error {
        Error::Io { path: path.into(), source }
    }
}

impl From<CommError> for Error {
    fn from(err: CommError) -> Error {
        match err {
            CommError::LevelRange(level) => Error::LevelRange(format!("tree level {}", level)),
            CommError::InvalidSize { .. } => Error::InvalidArgument(err.to_string()),
            CommError::Logic(msg) => Error::Logic(msg.to_owned()),
        }
    }
}

impl From<ShmemError> for Error {
    fn from(err: ShmemError) -> Error {
        match err {
            ShmemError::Invalid(msg) => Error::InvalidArgument(msg),
            ShmemError::Timeout(key) => Error::Runtime(format!("shmem attach timed out: {}", key)),
            ShmemError::Os { .. } => Error::Runtime(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Error::FileParse(err.to_string())
    }
}

/// The canonical text for an outgoing error code.
pub fn error_message(code: i32) -> &'static str {
    match code {
        0 => "success",
        -1 => "invalid argument",
        -2 => "runtime error",
        -3 => "logic error",
        -4 => "file parse error",
        -5 => "level out of range",
        -6 => "not implemented",
        -7 => "io error",
        -8 => "application stalled",
        ERROR_HELP => "success",
        _ => "unknown error",
    }
}

/// Flattens a result into a process exit code, logging the error once.
pub fn exit_code(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("steer: {}", err);
            err.code()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_distinct() {
        let errors = [
            Error::InvalidArgument("x".into()),
            Error::Runtime("x".into()),
            Error::Logic("x".into()),
            Error::FileParse("x".into()),
            Error::LevelRange("x".into()),
            Error::NotImplemented("x".into()),
            Error::io("/dev/null", io::Error::from(io::ErrorKind::NotFound)),
            Error::AppStalled("x".into()),
        ];
        let codes: Vec<_> = errors.iter().map(Error::code).collect();
        let mut unique = codes.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), codes.len());
        assert!(codes.iter().all(|c| *c < 0));
    }

    #[test]
    fn help_sentinel_is_success() {
        assert_eq!(error_message(ERROR_HELP), "success");
        assert_eq!(error_message(0), "success");
    }

    #[test]
    fn comm_errors_map_to_kinds() {
        let err: Error = CommError::LevelRange(3).into();
        assert_eq!(err.code(), -5);
        let err: Error = CommError::Logic("nope").into();
        assert_eq!(err.code(), -3);
    }
}
