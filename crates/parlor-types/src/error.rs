use thiserror::Error;

/// Failure taxonomy shared by the services, the gateway and the HTTP layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("{0} not found")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden(reason.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }

    /// True for rejections a caller caused, as opposed to server faults.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
