//! Paginated thread reading with live stream merge
//!
//! The read model serves two kinds of message at once: settled rows
//! straight from the store, and in-flight ones whose text is still
//! growing. For the latter the stored row only says `streaming`; the
//! current text comes from the stream registry and is attached to the view
//! as an overlay, so a page is always internally consistent even while
//! generation continues.
//!
//! Reading also repairs abandoned streams. A message stuck in `streaming`
//! with no live session (the process restarted, or a driver died without
//! cleanup) is moved to `failed` once it has gone stale, so readers never
//! wait on a stream that nobody is writing.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::ChatError;
use crate::storage::{unix_timestamp_ms, Message, MessageStatus, ThreadId, ThreadStore};
use crate::stream::StreamRegistry;

/// Cursor-based message query. `after` is the ordering key of the last
/// message the caller already has.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub after: Option<i64>,
    /// `None` takes the configured default page size.
    pub limit: Option<usize>,
    /// Audit views include superseded messages; normal reads never see
    /// them.
    pub include_superseded: bool,
}

/// A message together with its live overlay.
#[derive(Debug, Clone)]
pub struct MessageView {
    pub message: Message,
    /// Text accumulated so far. Only present while the message is
    /// `streaming` with a live session; settled messages carry their text
    /// in `message.content`.
    pub live_text: Option<String>,
    /// Cursor matching `live_text`, comparable with delta cursors.
    pub live_cursor: Option<u64>,
}

/// One page of a thread, oldest first.
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<MessageView>,
    pub has_more: bool,
    /// Ordering key of the last item, to be passed as `after` for the next
    /// page.
    pub next_cursor: Option<i64>,
}

/// Read access to a thread's messages. Assumes the caller was already
/// authorized for the thread.
#[derive(Clone)]
pub struct ThreadReader {
    store: Arc<dyn ThreadStore>,
    registry: StreamRegistry,
    config: Arc<EngineConfig>,
}

impl ThreadReader {
    pub fn new(
        store: Arc<dyn ThreadStore>,
        registry: StreamRegistry,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// One page of messages, live text merged in.
    pub async fn list_messages(
        &self,
        thread_id: &ThreadId,
        query: &MessageQuery,
    ) -> Result<MessagePage, ChatError> {
        let limit = self.config.page_size(query.limit);

        // Fetch one past the page to learn whether more follow.
        let mut fetched = self
            .store
            .list_messages(thread_id, query.after, limit + 1, query.include_superseded)
            .await?;
        let has_more = fetched.len() > limit;
        fetched.truncate(limit);

        let mut messages = Vec::with_capacity(fetched.len());
        for message in fetched {
            messages.push(self.view_of(message).await?);
        }

        Ok(MessagePage {
            next_cursor: messages.last().map(|v| v.message.seq),
            has_more,
            messages,
        })
    }

    /// Attach the live overlay, reconciling orphaned streams on the way.
    async fn view_of(&self, message: Message) -> Result<MessageView, ChatError> {
        if message.status != MessageStatus::Streaming {
            return Ok(MessageView {
                message,
                live_text: None,
                live_cursor: None,
            });
        }

        if let Some(snapshot) = self.registry.snapshot(&message.id) {
            return Ok(MessageView {
                message,
                live_text: Some(snapshot.text),
                live_cursor: Some(snapshot.cursor),
            });
        }

        // Streaming but nobody is writing. Give a fresh stream a grace
        // period to register, then fail it so readers stop waiting.
        let stale_ms = self.config.stale_after().as_millis() as i64;
        let age_ms = unix_timestamp_ms().saturating_sub(message.updated_at);
        if age_ms <= stale_ms {
            return Ok(MessageView {
                message,
                live_text: None,
                live_cursor: None,
            });
        }

        tracing::warn!(
            message_id = %message.id,
            age_ms,
            "orphaned stream, marking failed"
        );
        let reconciled = match self
            .store
            .transition_status(
                &message.id,
                &[MessageStatus::Streaming],
                MessageStatus::Failed,
                None,
            )
            .await
        {
            Ok(updated) => updated,
            // Lost the race to a concurrent reconciler or a late commit;
            // either way the message has settled.
            Err(_) => self
                .store
                .get_message(&message.id)
                .await?
                .unwrap_or(message),
        };
        Ok(MessageView {
            message: reconciled,
            live_text: None,
            live_cursor: None,
        })
    }
}
