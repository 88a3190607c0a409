//! Error types shared by every stage of a run.
//!
//! Each variant carries the location (URL, entry name or path) it relates to so
//! that per-archive and per-entry failures can be reported without extra context.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while resolving, indexing or fetching remote archives.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote host could not be reached or answered unexpectedly.
    #[error("connection error for {location}: {reason}")]
    Connection { location: String, reason: String },

    /// Credentials were missing, incomplete or rejected.
    #[error("authentication failed for {location}: {reason}")]
    Auth { location: String, reason: String },

    /// The product or archive does not exist.
    #[error("not found: {location}")]
    NotFound { location: String },

    /// The server ignores `Range` requests; another backend is required.
    #[error("{location} does not support byte-range requests")]
    RangeUnsupported { location: String },

    /// The ZIP directory or a local header did not parse.
    #[error("corrupt archive {location}: {reason}")]
    CorruptArchive { location: String, reason: String },

    /// A retryable network fault (timeout, reset, 5xx, 429).
    #[error("transient I/O error for {location}: {reason}")]
    TransientIo { location: String, reason: String },

    /// An output path would leave the output root, or another archive of
    /// the run already writes it.
    #[error("refusing to write {name:?}: {reason}")]
    PathConflict { name: String, reason: String },

    /// Local filesystem error.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed user input (product list, option combination).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The run was cancelled before the operation completed.
    #[error("cancelled")]
    Cancelled,
}

/// Coarse classification of an [`Error`], used in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Auth,
    NotFound,
    RangeUnsupported,
    CorruptArchive,
    TransientIo,
    PathConflict,
    Io,
    InvalidInput,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Auth => "AuthError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::RangeUnsupported => "RangeUnsupportedError",
            ErrorKind::CorruptArchive => "CorruptArchiveError",
            ErrorKind::TransientIo => "TransientIOError",
            ErrorKind::PathConflict => "PathConflictError",
            ErrorKind::Io => "IOError",
            ErrorKind::InvalidInput => "InvalidInputError",
            ErrorKind::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

impl Error {
    pub fn connection(location: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Connection {
            location: location.into(),
            reason: reason.to_string(),
        }
    }

    pub fn auth(location: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Auth {
            location: location.into(),
            reason: reason.to_string(),
        }
    }

    pub fn not_found(location: impl Into<String>) -> Self {
        Self::NotFound {
            location: location.into(),
        }
    }

    pub fn range_unsupported(location: impl Into<String>) -> Self {
        Self::RangeUnsupported {
            location: location.into(),
        }
    }

    pub fn corrupt(location: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::CorruptArchive {
            location: location.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transient(location: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::TransientIo {
            location: location.into(),
            reason: reason.to_string(),
        }
    }

    pub fn path_conflict(name: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::PathConflict {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Maps a non-success HTTP status to the matching error.
    pub fn from_status(location: impl Into<String>, status: u16) -> Self {
        let location = location.into();
        match status {
            401 | 403 | 407 => Self::auth(location, format!("HTTP {status}")),
            404 | 410 => Self::not_found(location),
            408 | 429 => Self::transient(location, format!("HTTP {status}")),
            s if (500..600).contains(&s) => Self::transient(location, format!("HTTP {status}")),
            _ => Self::connection(location, format!("unexpected HTTP {status}")),
        }
    }

    /// Maps a reqwest error; timeouts and dropped connections are retryable.
    pub fn from_reqwest(location: impl Into<String>, err: reqwest::Error) -> Self {
        let location = location.into();
        if let Some(status) = err.status() {
            return Self::from_status(location, status.as_u16());
        }
        if err.is_timeout() || err.is_connect() || err.is_body() || err.is_request() {
            Self::transient(location, err)
        } else {
            Self::connection(location, err)
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection { .. } => ErrorKind::Connection,
            Error::Auth { .. } => ErrorKind::Auth,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::RangeUnsupported { .. } => ErrorKind::RangeUnsupported,
            Error::CorruptArchive { .. } => ErrorKind::CorruptArchive,
            Error::TransientIo { .. } => ErrorKind::TransientIo,
            Error::PathConflict { .. } => ErrorKind::PathConflict,
            Error::Io { .. } => ErrorKind::Io,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// The same kind of error, reported against `location`. Used when one
    /// failure stands for several items, e.g. a catalog query for many
    /// products.
    pub fn with_location(&self, location: impl Into<String>) -> Self {
        let location = location.into();
        match self {
            Error::Connection { .. } => Self::connection(location, self),
            Error::Auth { .. } => Self::auth(location, self),
            Error::NotFound { .. } => Self::not_found(location),
            Error::RangeUnsupported { .. } => Self::range_unsupported(location),
            Error::CorruptArchive { .. } => Self::corrupt(location, self),
            Error::TransientIo { .. } => Self::transient(location, self),
            Error::PathConflict { name, reason } => Self::path_conflict(name.clone(), reason),
            Error::Io { path, source } => {
                Self::io(path.clone(), std::io::Error::new(source.kind(), source.to_string()))
            }
            Error::InvalidInput(reason) => Self::InvalidInput(reason.clone()),
            Error::Cancelled => Self::Cancelled,
        }
    }

    /// Only transient network faults are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientIo { .. })
    }
}
