//! Error types for the replication daemon.

use std::path::PathBuf;
use thiserror::Error;

/// A change record could not be parsed.
///
/// Malformed records are dropped by the ingestor; they never enter the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed change record: {msg}")]
pub struct ParseError {
    /// What was wrong with the record.
    pub msg: String,
}

impl ParseError {
    /// Create a parse error with the given message.
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }
}

/// Invalid daemon or replica configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required setting is missing.
    #[error("missing {field} for replica {replica}")]
    MissingField {
        /// Name of the missing setting.
        field: &'static str,
        /// Replica the setting belongs to, as far as it is known.
        replica: String,
    },

    /// Kerberos binds are no longer supported.
    #[error("replica {replica}: bind method \"kerberos\" is no longer supported")]
    KerberosUnsupported {
        /// Replica that asked for a Kerberos bind.
        replica: String,
    },

    /// A value could not be interpreted.
    #[error("invalid value for {field}: {value}")]
    InvalidValue {
        /// Name of the setting.
        field: &'static str,
        /// The offending value.
        value: String,
    },

    /// The config file has an extension we do not know how to read.
    #[error("unsupported config file extension: {ext}")]
    UnsupportedFormat {
        /// The extension that was found.
        ext: String,
    },

    /// The config file could not be deserialized.
    #[error("config syntax error: {msg}")]
    Syntax {
        /// Message from the underlying reader.
        msg: String,
    },
}

/// Outcome of a failed operation on a replica.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpError {
    /// The replica is unreachable or went down; try again later.
    #[error("replica unavailable: {msg}")]
    Retryable {
        /// Diagnostic text.
        msg: String,
    },

    /// The replica refused the operation; retrying will not help.
    #[error("{msg}")]
    Fatal {
        /// Diagnostic text as reported by the replica.
        msg: String,
    },
}

impl OpError {
    /// A retryable error.
    pub fn retryable(msg: impl Into<String>) -> Self {
        OpError::Retryable { msg: msg.into() }
    }

    /// A fatal error.
    pub fn fatal(msg: impl Into<String>) -> Self {
        OpError::Fatal { msg: msg.into() }
    }

    /// Whether the operation may succeed if tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OpError::Retryable { .. })
    }
}

/// A session to a replica could not be established.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot connect to {replica}: {msg}")]
pub struct ConnectError {
    /// Replica, as `host:port`.
    pub replica: String,
    /// What went wrong.
    pub msg: String,
}

impl From<ConnectError> for OpError {
    fn from(e: ConnectError) -> Self {
        OpError::Retryable { msg: e.to_string() }
    }
}

/// Errors that can occur in the replication daemon.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Change record parsing failed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The status file contains a line we cannot interpret.
    #[error("status file {path}: bad line {line:?}")]
    StatusFile {
        /// Path of the status file.
        path: PathBuf,
        /// The offending line.
        line: String,
    },

    /// An advisory lock could not be taken.
    #[error("cannot lock {path}: {source}")]
    Lock {
        /// The file whose lock failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Startup sanity checks failed.
    #[error("startup checks failed: {}", problems.join("; "))]
    Sanity {
        /// Every problem found, in check order.
        problems: Vec<String>,
    },

    /// A worker or ingestor thread could not be started.
    #[error("cannot start thread {name}: {source}")]
    ThreadSpawn {
        /// Thread name.
        name: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The queue dump file could not be written.
    #[error("cannot write dump {path}: {source}")]
    Dump {
        /// Path of the dump file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
