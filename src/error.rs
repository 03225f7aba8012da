use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum TransferError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    #[error("file already exists: {0}")]
    FileExists(String),
    #[error("network error: {0}")]
    NetworkError(String),
}

impl TransferError {
    pub(crate) fn network(context: &str, err: impl std::fmt::Display) -> Self {
        TransferError::NetworkError(format!("{context}: {err}"))
    }

    pub(crate) fn auth(context: &str, err: impl std::fmt::Display) -> Self {
        TransferError::AuthFailure(format!("{context}: {err}"))
    }
}
