//! Unified storage error model.
//! Every layer (file primitive, blob store, attachments, datasets) reports through
//! `StoreError` so the external HTTP layer can map failures with `http_status()`.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Resource absent, including corrupt-with-no-backup.
    #[error("not_found: {0}")]
    NotFound(String),
    /// Decode failure that could not be recovered from the backup file.
    #[error("corrupt: {0}")]
    Corrupt(String),
    /// A path resolved outside the configured root. Never recovered.
    #[error("path_security: {0}")]
    PathSecurity(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation: {0}")]
    Validation(String),
    /// Raised only by non-blocking lock attempts; blocking callers queue.
    #[error("lock_contention: {0}")]
    LockContention(String),
    #[error("codec: {0}")]
    Codec(String),
    #[error("io: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub fn not_found<S: Into<String>>(msg: S) -> Self { StoreError::NotFound(msg.into()) }
    pub fn corrupt<S: Into<String>>(msg: S) -> Self { StoreError::Corrupt(msg.into()) }
    pub fn path_security<S: Into<String>>(msg: S) -> Self { StoreError::PathSecurity(msg.into()) }
    pub fn conflict<S: Into<String>>(msg: S) -> Self { StoreError::Conflict(msg.into()) }
    pub fn validation<S: Into<String>>(msg: S) -> Self { StoreError::Validation(msg.into()) }
    pub fn lock_contention<S: Into<String>>(msg: S) -> Self { StoreError::LockContention(msg.into()) }
    pub fn codec<S: Into<String>>(msg: S) -> Self { StoreError::Codec(msg.into()) }

    /// Wrap an io error with the operation/path it happened on.
    /// `NotFound` io errors become `StoreError::NotFound`.
    pub fn io<S: Into<String>>(context: S, source: io::Error) -> Self {
        let context = context.into();
        if source.kind() == io::ErrorKind::NotFound {
            return StoreError::NotFound(context);
        }
        StoreError::Io { context, source }
    }

    pub fn code_str(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "not_found",
            StoreError::Corrupt(_) => "corrupt",
            StoreError::PathSecurity(_) => "path_security",
            StoreError::Conflict(_) => "conflict",
            StoreError::Validation(_) => "validation",
            StoreError::LockContention(_) => "lock_contention",
            StoreError::Codec(_) => "codec",
            StoreError::Io { .. } => "io",
        }
    }

    /// Map to HTTP status code for the external controller layer.
    pub fn http_status(&self) -> u16 {
        match self {
            StoreError::NotFound(_) => 404,
            StoreError::Corrupt(_) => 500,
            StoreError::PathSecurity(_) => 403,
            StoreError::Conflict(_) => 409,
            StoreError::Validation(_) => 400,
            StoreError::LockContention(_) => 423,
            StoreError::Codec(_) => 422,
            StoreError::Io { .. } => 503,
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self { StoreError::Codec(err.to_string()) }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self { StoreError::Codec(err.to_string()) }
}
