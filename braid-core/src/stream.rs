//! Delta streaming pipeline
//!
//! A generation job pulls raw chunks from the model backend, cuts them into
//! visible deltas (word or line boundaries), and flushes them at most once
//! per throttle window. Each flush persists the accumulated text through the
//! status machine, updates the in-process stream registry, and fans the
//! delta out to the event bus. Readers that attach mid-stream take a
//! snapshot from the registry and apply later deltas on top using the
//! cursor carried by every delta.
//!
//! A flush that lands inside the throttle window is deferred, never
//! dropped: the remainder goes out with the next window or with the final
//! commit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use llm::{ChatMessage, ChatModel, ChatRequest};
use tokio::sync::broadcast;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{ChunkingPolicy, EngineConfig};
use crate::engine::{SharedEventSender, ThreadEvent};
use crate::error::ChatError;
use crate::ledger::MessageLedger;
use crate::storage::{Message, MessageId, MessageRole, MessageStatus, ThreadId, ThreadStore};

// ============================================================================
// Chunking
// ============================================================================

/// Cuts buffered model output at policy boundaries.
///
/// Text pushed in stays buffered until a boundary makes a prefix ready:
/// the last whitespace for `Word`, the last newline for `Line`. The tail
/// after the boundary waits for more input or [`Chunker::take_rest`].
pub struct Chunker {
    policy: ChunkingPolicy,
    pending: String,
}

impl Chunker {
    pub fn new(policy: ChunkingPolicy) -> Self {
        Self {
            policy,
            pending: String::new(),
        }
    }

    pub fn push(&mut self, text: &str) {
        self.pending.push_str(text);
    }

    /// Byte offset just past the last boundary, if any.
    fn boundary(&self) -> Option<usize> {
        match self.policy {
            ChunkingPolicy::Word => self
                .pending
                .char_indices()
                .rev()
                .find(|(_, c)| c.is_whitespace())
                .map(|(i, c)| i + c.len_utf8()),
            ChunkingPolicy::Line => self.pending.rfind('\n').map(|i| i + 1),
        }
    }

    pub fn has_ready(&self) -> bool {
        self.boundary().is_some()
    }

    /// Drain the ready prefix, boundary included.
    pub fn take_ready(&mut self) -> Option<String> {
        let at = self.boundary()?;
        let rest = self.pending.split_off(at);
        Some(std::mem::replace(&mut self.pending, rest))
    }

    /// Drain whatever is left, boundary or not.
    pub fn take_rest(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }
}

// ============================================================================
// Stream registry
// ============================================================================

/// Accumulated live text of one streaming message.
///
/// `cursor` is the byte length of `text`; deltas carry the cursor value
/// that is valid after applying them, so a reader can discard deltas at
/// or below its snapshot cursor and append the rest.
#[derive(Debug, Clone, Default)]
pub struct StreamSnapshot {
    pub cursor: u64,
    pub text: String,
}

/// One flushed delta, as fanned out to subscribers.
#[derive(Debug, Clone)]
pub struct StreamDelta {
    pub cursor: u64,
    pub delta: String,
}

struct StreamSession {
    thread_id: ThreadId,
    snapshot: StreamSnapshot,
    deltas: broadcast::Sender<StreamDelta>,
    cancel: CancellationToken,
}

/// In-process directory of live generation streams, keyed by message.
///
/// The generation driver registers itself here before touching the model
/// and removes itself when it ends, whatever way it ends. Everything else
/// (readers, retry, delete) only ever observes or cancels.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    inner: Arc<Mutex<HashMap<MessageId, StreamSession>>>,
}

/// Subscribers that fall behind by more than this many deltas must
/// resynchronize from a fresh snapshot.
const DELTA_CHANNEL_CAPACITY: usize = 256;

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live session. Returns the token the driver watches for
    /// cancellation.
    pub fn register(&self, thread_id: ThreadId, message_id: MessageId) -> CancellationToken {
        let cancel = CancellationToken::new();
        let (deltas, _) = broadcast::channel(DELTA_CHANNEL_CAPACITY);
        let session = StreamSession {
            thread_id,
            snapshot: StreamSnapshot::default(),
            deltas,
            cancel: cancel.clone(),
        };
        self.inner
            .lock()
            .unwrap()
            .insert(message_id, session);
        cancel
    }

    /// Append a flushed delta to the session and fan it out.
    /// Returns the cursor after the append, or `None` if no session is live.
    pub fn publish(&self, message_id: &MessageId, delta: &str) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner.get_mut(message_id)?;
        session.snapshot.text.push_str(delta);
        session.snapshot.cursor = session.snapshot.text.len() as u64;
        let cursor = session.snapshot.cursor;
        let _ = session.deltas.send(StreamDelta {
            cursor,
            delta: delta.to_string(),
        });
        Some(cursor)
    }

    pub fn snapshot(&self, message_id: &MessageId) -> Option<StreamSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner.get(message_id).map(|s| s.snapshot.clone())
    }

    /// Snapshot plus a subscription for the deltas that follow it, taken
    /// under one lock so nothing falls in between.
    pub fn subscribe(
        &self,
        message_id: &MessageId,
    ) -> Option<(StreamSnapshot, broadcast::Receiver<StreamDelta>)> {
        let inner = self.inner.lock().unwrap();
        let session = inner.get(message_id)?;
        Some((session.snapshot.clone(), session.deltas.subscribe()))
    }

    pub fn is_live(&self, message_id: &MessageId) -> bool {
        self.inner.lock().unwrap().contains_key(message_id)
    }

    /// Cancel every live session belonging to a thread.
    pub fn cancel_thread(&self, thread_id: &ThreadId) {
        let inner = self.inner.lock().unwrap();
        for session in inner.values() {
            if &session.thread_id == thread_id {
                session.cancel.cancel();
            }
        }
    }

    pub fn remove(&self, message_id: &MessageId) {
        self.inner.lock().unwrap().remove(message_id);
    }
}

// ============================================================================
// Generation driver
// ============================================================================

/// Streaming knobs, lifted out of [`EngineConfig`] so jobs carry only what
/// they use.
#[derive(Debug, Clone)]
pub struct StreamTuning {
    pub policy: ChunkingPolicy,
    pub throttle: Duration,
    pub timeout: Duration,
}

impl StreamTuning {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            policy: config.chunking,
            throttle: config.throttle(),
            timeout: config.stream_timeout(),
        }
    }
}

/// How a generation job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Final text committed.
    Completed,
    /// Marked failed (backend error or timeout), partial text kept.
    Failed,
    /// Someone else ended the message first (cancel, delete, or a
    /// conflicting transition). Nothing was written on the way out.
    Aborted,
}

/// One generation job: fills a single assistant placeholder from the model.
pub struct GenerationJob {
    pub store: Arc<dyn ThreadStore>,
    pub registry: StreamRegistry,
    pub model: Arc<dyn ChatModel + Send + Sync>,
    pub events: SharedEventSender,
    pub tuning: StreamTuning,
    pub system_prompt: Option<String>,
    pub thread_id: ThreadId,
    pub message_id: MessageId,
}

impl GenerationJob {
    pub async fn run(self) -> StreamOutcome {
        let ledger = MessageLedger::new(self.store.clone());
        let cancel = self
            .registry
            .register(self.thread_id.clone(), self.message_id.clone());

        let mut accumulated = String::new();
        let driven = time::timeout(
            self.tuning.timeout,
            self.drive(&ledger, &cancel, &mut accumulated),
        )
        .await;

        let outcome = match driven {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                tracing::warn!(
                    message_id = %self.message_id,
                    error = %err,
                    "generation failed"
                );
                self.record_failure(&ledger, &accumulated, &err.to_string())
                    .await
            }
            Err(_) => {
                tracing::warn!(
                    message_id = %self.message_id,
                    timeout_secs = self.tuning.timeout.as_secs(),
                    "generation timed out"
                );
                self.record_failure(&ledger, &accumulated, "generation timed out")
                    .await
            }
        };

        self.registry.remove(&self.message_id);
        outcome
    }

    async fn drive(
        &self,
        ledger: &MessageLedger,
        cancel: &CancellationToken,
        accumulated: &mut String,
    ) -> Result<StreamOutcome, ChatError> {
        let Some(placeholder) = self.store.get_message(&self.message_id).await? else {
            return Ok(StreamOutcome::Aborted);
        };
        if placeholder.status != MessageStatus::Pending {
            return Ok(StreamOutcome::Aborted);
        }

        let history = self.store.thread_messages(&self.thread_id).await?;
        let request_messages =
            build_history(&history, placeholder.seq, self.system_prompt.as_deref());
        let request = ChatRequest::new(&request_messages);

        let mut stream = self
            .model
            .stream_chat(&request)
            .await
            .map_err(ChatError::Backend)?;

        let mut chunker = Chunker::new(self.tuning.policy);
        let mut started = false;
        let mut next_flush = Instant::now();

        loop {
            if chunker.has_ready() && Instant::now() >= next_flush {
                if !self
                    .flush(ledger, &mut chunker, &mut started, accumulated)
                    .await?
                {
                    return Ok(StreamOutcome::Aborted);
                }
                next_flush = Instant::now() + self.tuning.throttle;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(StreamOutcome::Aborted),
                maybe_chunk = stream.next() => match maybe_chunk {
                    Some(Ok(chunk)) => chunker.push(&chunk.content),
                    Some(Err(err)) => {
                        // Broken stream: keep whatever is buffered as the
                        // failed message's partial text.
                        accumulated.push_str(&chunker.take_rest());
                        return Err(ChatError::Backend(err));
                    }
                    None => break,
                },
                _ = time::sleep_until(next_flush), if chunker.has_ready() => {}
            }
        }

        // Stream ended: everything still buffered goes out with the commit.
        // If no delta ever flushed this commits straight from pending,
        // which is also how an empty stream completes with empty content.
        let tail = chunker.take_rest();
        accumulated.push_str(&tail);
        match ledger.commit(&self.message_id, accumulated).await {
            Ok(_) => {}
            Err(ChatError::InvalidTransition { .. }) | Err(ChatError::NotFound(_)) => {
                return Ok(StreamOutcome::Aborted)
            }
            Err(err) => return Err(err),
        }

        if !tail.is_empty() {
            let cursor = self
                .registry
                .publish(&self.message_id, &tail)
                .unwrap_or(accumulated.len() as u64);
            let _ = self.events.send((
                self.thread_id.clone(),
                ThreadEvent::AssistantDelta {
                    message_id: self.message_id.clone(),
                    cursor,
                    delta: tail,
                },
            ));
        }
        let _ = self.events.send((
            self.thread_id.clone(),
            ThreadEvent::AssistantCompleted {
                message_id: self.message_id.clone(),
            },
        ));
        Ok(StreamOutcome::Completed)
    }

    /// Flush the ready prefix: persist, update the registry, fan out.
    ///
    /// Returns `Ok(false)` when the message was ended behind our back, in
    /// which case the stream must be abandoned without further writes.
    async fn flush(
        &self,
        ledger: &MessageLedger,
        chunker: &mut Chunker,
        started: &mut bool,
        accumulated: &mut String,
    ) -> Result<bool, ChatError> {
        let Some(delta) = chunker.take_ready() else {
            return Ok(true);
        };
        accumulated.push_str(&delta);

        if !*started {
            match ledger.begin_streaming(&self.message_id).await {
                Ok(_) => *started = true,
                Err(ChatError::InvalidTransition { .. }) | Err(ChatError::NotFound(_)) => {
                    return Ok(false)
                }
                Err(err) => return Err(err),
            }
        }
        match ledger.record_partial(&self.message_id, accumulated).await {
            Ok(_) => {}
            Err(ChatError::InvalidTransition { .. }) | Err(ChatError::NotFound(_)) => {
                return Ok(false)
            }
            Err(err) => return Err(err),
        }

        let cursor = self
            .registry
            .publish(&self.message_id, &delta)
            .unwrap_or(accumulated.len() as u64);
        tracing::debug!(message_id = %self.message_id, cursor, "delta flushed");
        let _ = self.events.send((
            self.thread_id.clone(),
            ThreadEvent::AssistantDelta {
                message_id: self.message_id.clone(),
                cursor,
                delta,
            },
        ));
        Ok(true)
    }

    /// Best-effort move to `failed`, keeping the flushed partial text.
    /// If the message already left the stream states, report an abort
    /// instead.
    async fn record_failure(
        &self,
        ledger: &MessageLedger,
        accumulated: &str,
        reason: &str,
    ) -> StreamOutcome {
        match ledger.fail(&self.message_id, Some(accumulated)).await {
            Ok(_) => {
                let _ = self.events.send((
                    self.thread_id.clone(),
                    ThreadEvent::AssistantFailed {
                        message_id: self.message_id.clone(),
                        reason: reason.to_string(),
                    },
                ));
                StreamOutcome::Failed
            }
            Err(_) => StreamOutcome::Aborted,
        }
    }
}

/// Prior turns of the thread as a model request, oldest first.
///
/// Only completed turns strictly before the placeholder count: failed,
/// superseded, and in-flight messages never reach the model.
pub(crate) fn build_history(
    messages: &[Message],
    before_seq: i64,
    system_prompt: Option<&str>,
) -> Vec<ChatMessage> {
    let mut request = Vec::new();
    if let Some(prompt) = system_prompt {
        request.push(ChatMessage::system(prompt));
    }
    for message in messages {
        if message.seq >= before_seq || message.status != MessageStatus::Complete {
            continue;
        }
        request.push(match message.role {
            MessageRole::User => ChatMessage::user(&message.content),
            MessageRole::Assistant => ChatMessage::assistant(&message.content),
        });
    }
    request
}
