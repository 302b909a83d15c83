use thiserror::Error;

/// Failures talking to the session store. All of them are transient from
/// the caller's point of view.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store operation timed out")]
    Timeout,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("race record codec error: {0}")]
    Codec(#[from] bincode::Error),
}

impl StoreError {
    /// Whether repeating the call could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Timeout | StoreError::Unavailable(_))
    }
}
