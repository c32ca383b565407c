use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The caller cancelled the query. Not a failure and not logged as one.
    #[error("query cancelled")]
    Cancelled,
    /// Placeholders and arguments do not line up.
    #[error("cannot bind arguments: {0}")]
    Bind(String),
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    #[error("storage request failed: {0}")]
    Transport(String),
    #[error("storage error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("row decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
