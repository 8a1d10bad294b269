use thiserror::Error;

/// Failure taxonomy for the whole gateway. Each variant maps onto exactly one
/// HTTP status at the API boundary; dispatch and callback paths convert
/// provider failures into persisted terminal job state instead of re-raising.
#[derive(Debug, Error)]
pub enum FaxError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("unauthorized: {0}")]
    Auth(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("configuration: {0}")]
    Config(String),
    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for FaxError {
    fn from(err: rusqlite::Error) -> Self {
        FaxError::Internal(anyhow::Error::new(err).context("job store"))
    }
}

impl From<std::io::Error> for FaxError {
    fn from(err: std::io::Error) -> Self {
        FaxError::Internal(anyhow::Error::new(err))
    }
}

/// Distinguishes transport-level failures (worth retrying) from application
/// rejections the vendor has already made a decision about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Transport,
    Application,
}

/// Error emitted by send adapters and the manifest interpreter.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProviderError {
    kind: ProviderErrorKind,
    message: String,
}

impl ProviderError {
    /// A connection, timeout, or protocol failure before the vendor answered.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transport,
            message: message.into(),
        }
    }

    /// A vendor-level rejection (4xx, malformed response, missing id).
    pub fn application(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Application,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ProviderErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Transport failures are retried by the dispatch policy; application
    /// rejections are terminal on the first attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind == ProviderErrorKind::Transport
    }
}
