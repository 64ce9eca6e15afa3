use thiserror::Error;

/// Main error type for Nautex operations
#[derive(Error, Debug)]
pub enum NautexError {
    #[error("index already closed")]
    AlreadyClosed,

    #[error("no destination for partition: {0}")]
    RouteUnknown(String),

    #[error("consistency wait unsupported level: {0}")]
    ConsistencyUnsupported(String),

    #[error("consistency wait closed")]
    ConsistencyClosed,

    #[error("cancelled")]
    Cancelled,

    #[error("unexpected size for persisted seq bytes: {0}")]
    Corrupt(usize),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("rollback requested, partition: {partition}, seq: {seq}")]
    RollbackRequested { partition: String, seq: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Nautex operations
pub type Result<T> = std::result::Result<T, NautexError>;

impl NautexError {
    /// Check if this error indicates a transient failure that the feed
    /// layer could retry with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(self, NautexError::Engine(_) | NautexError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NautexError::RouteUnknown("42".to_string());
        assert_eq!(err.to_string(), "no destination for partition: 42");

        let err = NautexError::Corrupt(3);
        assert_eq!(err.to_string(), "unexpected size for persisted seq bytes: 3");
    }

    #[test]
    fn test_retriable_errors() {
        assert!(NautexError::Engine("apply failed".to_string()).is_retriable());
        assert!(!NautexError::AlreadyClosed.is_retriable());
        assert!(!NautexError::Cancelled.is_retriable());
    }
}
