use thiserror::Error;

/// Abstract error classification used for logging and surfacing to callers.
/// Mirrors the kinds named in the write-path and replication contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    StaleVersion,
    Transient,
    Invariant,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("stale version: expected {expected}, current {current}")]
    StaleVersion { expected: i64, current: i64 },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::StaleVersion { .. } => ErrorKind::StaleVersion,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Invariant(_) => ErrorKind::Invariant,
            Self::Internal(_) => ErrorKind::Invariant,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
