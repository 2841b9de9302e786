use std::sync::Arc;
use thiserror::Error;

/// Errors are `Clone` so one failed creation can reject every waiter.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("Invalid resource params: {0}")]
    InvalidParams(String),

    #[error("Subscription failed for {key}: {reason}")]
    Subscription { key: String, reason: String },

    #[error("Unbalanced reference release for {0}")]
    UnbalancedReference(String),

    #[error("Teardown failed for {key}: {reason}")]
    Teardown { key: String, reason: String },

    #[error("Async call failed: {0}")]
    AsyncCall(String),

    #[error("JSON serialization error: {0}")]
    Serialization(#[source] Arc<serde_json::Error>),
}

impl SyncError {
    pub fn subscription(key: impl ToString, reason: impl ToString) -> Self {
        Self::Subscription {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn teardown(key: impl ToString, reason: impl ToString) -> Self {
        Self::Teardown {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_serialization_keeps_its_source() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let line = parse.line();
        let err = SyncError::from(parse);

        assert!(err.to_string().starts_with("JSON serialization error"));
        let source = err
            .source()
            .and_then(|source| source.downcast_ref::<Arc<serde_json::Error>>())
            .expect("source is the serde_json error");
        assert_eq!(source.line(), line);

        let cloned = err.clone();
        assert!(matches!(cloned, SyncError::Serialization(_)));
    }
}
