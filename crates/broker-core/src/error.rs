use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed payload or key; rejected before anything is stored.
    #[error("invalid job: {0}")]
    Validation(String),

    /// The referenced job or key is gone. Expected under races with the reaper.
    #[error("not found: {0}")]
    NotFound(String),

    /// An invariant would be violated, e.g. a second live lease for one jid.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl BrokerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BrokerError::NotFound(_))
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        BrokerError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
