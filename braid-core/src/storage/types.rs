//! Data types shared by all storage backends.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::ids::{JobId, MessageId, ThreadId, UserId};

/// Author of a stored message. The system prompt is engine configuration,
/// not a stored turn, so it has no role here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MessageRole> for llm::Role {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::User => llm::Role::User,
            MessageRole::Assistant => llm::Role::Assistant,
        }
    }
}

/// Lifecycle state of a message.
///
/// `pending` and `streaming` belong to an in-flight generation job;
/// the other three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Streaming,
    Complete,
    Failed,
    Superseded,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Streaming => "streaming",
            MessageStatus::Complete => "complete",
            MessageStatus::Failed => "failed",
            MessageStatus::Superseded => "superseded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "streaming" => Some(MessageStatus::Streaming),
            "complete" => Some(MessageStatus::Complete),
            "failed" => Some(MessageStatus::Failed),
            "superseded" => Some(MessageStatus::Superseded),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Complete | MessageStatus::Failed | MessageStatus::Superseded
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A conversation thread, owned by exactly one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub owner: UserId,
    pub title: String,
    /// Unix millisecond timestamp when created
    pub created_at: i64,
    /// Unix millisecond timestamp when last updated
    pub updated_at: i64,
}

/// One turn in a thread.
///
/// `seq` is the per-thread ordering key: strictly monotonic, assigned by the
/// store at append time. Content is mutable only while the message is
/// `streaming` (and at the commit that ends it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub role: MessageRole,
    pub seq: i64,
    pub content: String,
    pub status: MessageStatus,
    /// Backend model that produced (or will produce) this message.
    /// Assistant messages only.
    pub model: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Information about a thread for listing/display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub id: ThreadId,
    pub title: String,
    pub message_count: usize,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Generate,
    Title,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Generate => "generate",
            JobKind::Title => "title",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "generate" => Some(JobKind::Generate),
            "title" => Some(JobKind::Title),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Durable record of one scheduled background job.
///
/// For `generate` jobs the target is the assistant message being produced;
/// for `title` jobs it is the first user message the title derives from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub thread_id: ThreadId,
    pub message_id: MessageId,
    pub status: JobStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Compare-and-set refused: the record's current status was not in the
    /// expected set.
    #[error("message status is {actual}, transition refused")]
    Conflict { actual: MessageStatus },

    #[error("database error: {0}")]
    Database(String),
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            MessageStatus::Pending,
            MessageStatus::Streaming,
            MessageStatus::Complete,
            MessageStatus::Failed,
            MessageStatus::Superseded,
        ] {
            assert_eq!(MessageStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(MessageStatus::from_str("bogus"), None);
    }

    #[test]
    fn test_status_terminality() {
        assert!(!MessageStatus::Pending.is_terminal());
        assert!(!MessageStatus::Streaming.is_terminal());
        assert!(MessageStatus::Complete.is_terminal());
        assert!(MessageStatus::Failed.is_terminal());
        assert!(MessageStatus::Superseded.is_terminal());
    }

    #[test]
    fn test_status_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&MessageStatus::Superseded).unwrap(),
            "\"superseded\""
        );
        let parsed: MessageStatus = serde_json::from_str("\"streaming\"").unwrap();
        assert_eq!(parsed, MessageStatus::Streaming);
    }

    #[test]
    fn test_role_round_trip() {
        assert_eq!(MessageRole::from_str("user"), Some(MessageRole::User));
        assert_eq!(
            MessageRole::from_str("assistant"),
            Some(MessageRole::Assistant)
        );
        assert_eq!(MessageRole::from_str("system"), None);
    }

    #[test]
    fn test_job_kind_round_trip() {
        assert_eq!(JobKind::from_str("generate"), Some(JobKind::Generate));
        assert_eq!(JobKind::from_str("title"), Some(JobKind::Title));
        assert_eq!(JobKind::from_str(""), None);
    }
}
