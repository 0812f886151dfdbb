//! Message lifecycle operations
//!
//! Thin layer over the store that encodes which status transitions are
//! legal. Everything that moves a message through its lifecycle goes
//! through here, so the allowed edges of the state machine are written
//! down exactly once:
//!
//! ```text
//! pending -> streaming -> complete | failed
//! pending -> complete | failed          (empty or instant streams)
//! complete | failed -> superseded       (retry)
//! ```

use std::sync::Arc;

use crate::error::ChatError;
use crate::storage::{Message, MessageId, MessageRole, MessageStatus, ThreadId, ThreadStore};

#[derive(Clone)]
pub struct MessageLedger {
    store: Arc<dyn ThreadStore>,
}

impl MessageLedger {
    pub fn new(store: Arc<dyn ThreadStore>) -> Self {
        Self { store }
    }

    /// Record a user turn. User messages are born complete.
    pub async fn append_user_message(
        &self,
        thread_id: &ThreadId,
        text: &str,
    ) -> Result<Message, ChatError> {
        let message = self
            .store
            .append_message(thread_id, MessageRole::User, text, MessageStatus::Complete, None)
            .await?;
        Ok(message)
    }

    /// Reserve the assistant's slot in the thread before generation starts.
    ///
    /// The placeholder is empty, `pending`, and already tagged with the
    /// model that will fill it, so readers can render an in-progress turn
    /// and retries know what produced it.
    pub async fn append_placeholder(
        &self,
        thread_id: &ThreadId,
        model: &str,
    ) -> Result<Message, ChatError> {
        let message = self
            .store
            .append_message(
                thread_id,
                MessageRole::Assistant,
                "",
                MessageStatus::Pending,
                Some(model),
            )
            .await?;
        Ok(message)
    }

    /// First delta arrived: `pending` -> `streaming`.
    pub async fn begin_streaming(&self, message_id: &MessageId) -> Result<Message, ChatError> {
        let message = self
            .store
            .transition_status(
                message_id,
                &[MessageStatus::Pending],
                MessageStatus::Streaming,
                None,
            )
            .await?;
        Ok(message)
    }

    /// Persist accumulated text mid-stream without leaving `streaming`.
    ///
    /// Doubles as the liveness check: it fails once the message was
    /// deleted or moved out of `streaming` behind the writer's back.
    pub async fn record_partial(
        &self,
        message_id: &MessageId,
        text: &str,
    ) -> Result<Message, ChatError> {
        let message = self
            .store
            .transition_status(
                message_id,
                &[MessageStatus::Streaming],
                MessageStatus::Streaming,
                Some(text),
            )
            .await?;
        Ok(message)
    }

    /// Final text is in: move to `complete`.
    ///
    /// Accepts `pending` as well as `streaming` so a stream that ended
    /// before its first flush still commits.
    pub async fn commit(&self, message_id: &MessageId, text: &str) -> Result<Message, ChatError> {
        let message = self
            .store
            .transition_status(
                message_id,
                &[MessageStatus::Streaming, MessageStatus::Pending],
                MessageStatus::Complete,
                Some(text),
            )
            .await?;
        Ok(message)
    }

    /// Generation broke: move to `failed`, keeping whatever partial text
    /// was produced (pass `None` to keep the stored content untouched).
    pub async fn fail(
        &self,
        message_id: &MessageId,
        partial: Option<&str>,
    ) -> Result<Message, ChatError> {
        let message = self
            .store
            .transition_status(
                message_id,
                &[MessageStatus::Pending, MessageStatus::Streaming],
                MessageStatus::Failed,
                partial,
            )
            .await?;
        Ok(message)
    }

    /// A retry replaced this message: `complete` or `failed` -> `superseded`.
    ///
    /// In-flight messages cannot be superseded; callers see the refusal as
    /// an invalid transition.
    pub async fn supersede(&self, message_id: &MessageId) -> Result<Message, ChatError> {
        let message = self
            .store
            .transition_status(
                message_id,
                &[MessageStatus::Complete, MessageStatus::Failed],
                MessageStatus::Superseded,
                None,
            )
            .await?;
        Ok(message)
    }
}
