//! Error types for Mortar

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Mortar operations
pub type MortarResult<T> = Result<T, MortarError>;

/// Classification of fetch failures.
///
/// `Unreachable` and `Timeout` are transient and eligible for retry with
/// exponential backoff; `AuthRequired` and `Corrupted` are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Unreachable,
    AuthRequired,
    Corrupted,
    Timeout,
}

impl FetchErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchErrorKind::Unreachable | FetchErrorKind::Timeout)
    }
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchErrorKind::Unreachable => write!(f, "unreachable"),
            FetchErrorKind::AuthRequired => write!(f, "authentication required"),
            FetchErrorKind::Corrupted => write!(f, "corrupted payload"),
            FetchErrorKind::Timeout => write!(f, "timed out"),
        }
    }
}

/// Error produced by a `Fetcher` implementation.
#[derive(Error, Debug)]
#[error("fetch failed ({kind}): {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new<S: Into<String>>(kind: FetchErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unreachable<S: Into<String>>(message: S) -> Self {
        Self::new(FetchErrorKind::Unreachable, message)
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::new(FetchErrorKind::Timeout, message)
    }

    pub fn corrupted<S: Into<String>>(message: S) -> Self {
        Self::new(FetchErrorKind::Corrupted, message)
    }
}

/// Main error type for Mortar
#[derive(Error, Debug)]
pub enum MortarError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Manifest not found for package: {0}")]
    ManifestNotFound(String),

    #[error("Manifest parse error for {package}: {reason}")]
    ManifestParse { package: String, reason: String },

    #[error("No version of {package} satisfies constraint '{constraint}'")]
    VersionNotFound { package: String, constraint: String },

    #[error("Invalid version constraint: {0}")]
    InvalidConstraint(String),

    #[error("Version conflict for {package}: chose {chosen_version}, required by {required_by:?}")]
    VersionConflict {
        package: String,
        chosen_version: String,
        required_by: Vec<(String, String)>,
    },

    #[error("Cyclic dependency detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("Package {0} is not reachable from any project dependency")]
    OrphanPackage(String),

    #[error("{package}@{version} violates constraint '{constraint}' declared by {parent}")]
    ConstraintViolation {
        package: String,
        version: String,
        constraint: String,
        parent: String,
    },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Cache disk budget exceeded: entry {key} needs {needed} bytes, limit is {limit}")]
    DiskFull { key: String, needed: u64, limit: u64 },

    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("Corrupt cache entry {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Task {0} was cancelled")]
    Cancelled(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },

    #[error("Unknown task id: {0}")]
    UnknownTask(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,

    #[error("Git operation failed: {0}")]
    Git(String),

    #[error("{0}")]
    Other(String),
}

impl MortarError {
    /// Create a generic error from a string
    pub fn other<S: Into<String>>(msg: S) -> Self {
        MortarError::Other(msg.into())
    }

    /// Create a config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        MortarError::Config(msg.into())
    }

    /// Create a cache error
    pub fn cache<S: Into<String>>(msg: S) -> Self {
        MortarError::Cache(msg.into())
    }

    /// Create a git error
    pub fn git<S: Into<String>>(msg: S) -> Self {
        MortarError::Git(msg.into())
    }

    /// Whether a retry with backoff is worthwhile.
    ///
    /// Covers transient fetch failures and the interrupted/timed-out subset
    /// of IO errors surfaced by manifest readers.
    pub fn is_transient(&self) -> bool {
        match self {
            MortarError::Fetch(e) => e.kind.is_transient(),
            MortarError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
            ),
            MortarError::Timeout(_) => true,
            _ => false,
        }
    }
}
