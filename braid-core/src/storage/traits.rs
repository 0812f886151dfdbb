//! Storage contract for threads, messages, and job records.
//!
//! Implementations must keep per-thread ordering keys strictly monotonic and
//! serialize status transitions through [`ThreadStore::transition_status`],
//! which is the single atomic compare-and-set every lifecycle change goes
//! through.

use async_trait::async_trait;

use super::ids::{JobId, MessageId, ThreadId, UserId};
use super::types::{
    JobKind, JobRecord, JobStatus, Message, MessageRole, MessageStatus, StoreError, Thread,
    ThreadSummary,
};

#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Create a thread owned by `owner` with the given initial title.
    async fn create_thread(&self, owner: &UserId, title: &str) -> Result<Thread, StoreError>;

    async fn get_thread(&self, thread_id: &ThreadId) -> Result<Option<Thread>, StoreError>;

    /// The owner's threads, newest first, at most `limit`.
    async fn list_threads(
        &self,
        owner: &UserId,
        limit: usize,
    ) -> Result<Vec<ThreadSummary>, StoreError>;

    async fn rename_thread(&self, thread_id: &ThreadId, title: &str) -> Result<(), StoreError>;

    /// Delete a thread and everything it owns (messages, job records).
    async fn delete_thread(&self, thread_id: &ThreadId) -> Result<(), StoreError>;

    /// Append a message with the next ordering key for its thread.
    ///
    /// Fails with `ThreadNotFound` if the thread does not exist (or was
    /// deleted); a deleted thread never accepts new messages.
    async fn append_message(
        &self,
        thread_id: &ThreadId,
        role: MessageRole,
        content: &str,
        status: MessageStatus,
        model: Option<&str>,
    ) -> Result<Message, StoreError>;

    async fn get_message(&self, message_id: &MessageId) -> Result<Option<Message>, StoreError>;

    /// Look up a message by its exact ordering key.
    async fn message_at(
        &self,
        thread_id: &ThreadId,
        seq: i64,
    ) -> Result<Option<Message>, StoreError>;

    /// Atomic compare-and-set on message status.
    ///
    /// Succeeds only if the current status is in `expected`, moving the
    /// message to `next` (and replacing content when given) in the same
    /// operation. Fails with `Conflict` carrying the actual status
    /// otherwise, and with `MessageNotFound` once the message (or its
    /// thread) has been deleted.
    async fn transition_status(
        &self,
        message_id: &MessageId,
        expected: &[MessageStatus],
        next: MessageStatus,
        content: Option<&str>,
    ) -> Result<Message, StoreError>;

    /// Messages of a thread ascending by ordering key, starting strictly
    /// after `after_seq`, at most `limit`.
    async fn list_messages(
        &self,
        thread_id: &ThreadId,
        after_seq: Option<i64>,
        limit: usize,
        include_superseded: bool,
    ) -> Result<Vec<Message>, StoreError>;

    /// All of a thread's messages ascending by ordering key, superseded
    /// included.
    async fn thread_messages(&self, thread_id: &ThreadId) -> Result<Vec<Message>, StoreError> {
        self.list_messages(thread_id, None, usize::MAX, true).await
    }

    /// Model id of the most recent assistant message that carries one.
    async fn last_model(&self, thread_id: &ThreadId) -> Result<Option<String>, StoreError>;

    async fn record_job(&self, job: &JobRecord) -> Result<(), StoreError>;

    async fn update_job_status(&self, job_id: &JobId, status: JobStatus)
        -> Result<(), StoreError>;

    /// Most recent job of `kind` targeting the given message.
    async fn job_for_message(
        &self,
        message_id: &MessageId,
        kind: JobKind,
    ) -> Result<Option<JobRecord>, StoreError>;
}
