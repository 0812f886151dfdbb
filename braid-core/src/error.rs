//! Error types for thread and generation operations.

use thiserror::Error;

use crate::storage::{MessageStatus, StoreError};

/// Errors surfaced by thread operations.
///
/// Title generation failures are deliberately absent from the public
/// surface: the title job logs and falls back, callers never see it.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Caller has no identity, or the thread belongs to someone else.
    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    /// A lifecycle change was refused because the message is not in a
    /// status that allows it.
    #[error("invalid transition: message is {actual}")]
    InvalidTransition { actual: MessageStatus },

    /// The model backend failed mid-generation.
    #[error("backend failure: {0}")]
    Backend(#[source] anyhow::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ThreadNotFound(id) => ChatError::NotFound(format!("thread {id}")),
            StoreError::MessageNotFound(id) => ChatError::NotFound(format!("message {id}")),
            StoreError::Conflict { actual } => ChatError::InvalidTransition { actual },
            other => ChatError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_becomes_not_found() {
        let err: ChatError = StoreError::ThreadNotFound("t-1".into()).into();
        assert!(matches!(err, ChatError::NotFound(_)));
        assert!(err.to_string().contains("t-1"));
    }

    #[test]
    fn test_conflict_becomes_invalid_transition() {
        let err: ChatError = StoreError::Conflict {
            actual: MessageStatus::Streaming,
        }
        .into();
        match err {
            ChatError::InvalidTransition { actual } => {
                assert_eq!(actual, MessageStatus::Streaming)
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_database_errors_stay_wrapped() {
        let err: ChatError = StoreError::Database("disk full".into()).into();
        assert!(matches!(err, ChatError::Store(_)));
    }
}
