//! Error types for the widget core.
//!
//! `ApiError` covers a single HTTP exchange; `ChatError` is what session
//! operations hand back to the rendering layer.

/// Failure of one backend call.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ApiError {
    #[error("Request failed: {0}")]
    Network(String),

    #[error("HTTP error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Failed to parse JSON: {0}")]
    Decode(String),

    #[error("Response missing {0}")]
    MissingField(&'static str),
}

impl ApiError {
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Persistence failure in the identity store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error surfaced by a chat session operation.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Input or state made the request meaningless; callers treat it as a no-op.
    #[error("Invalid request: {0}")]
    Validation(&'static str),

    /// The result arrived after its context was replaced and was dropped.
    #[error("Discarded stale response")]
    Stale,

    #[error("Task {task_id} did not finish after {attempts} status checks")]
    PollTimedOut { task_id: String, attempts: u32 },

    #[error("Task {task_id} failed: {reason}")]
    PollFailed { task_id: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl ChatError {
    /// Validation and stale outcomes are silent by contract.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Stale)
    }
}
