//! ChatService - orchestrates threads, jobs, and event streaming
//!
//! This is the main API of the engine. It coordinates:
//! - Thread and message persistence (ThreadStore)
//! - Background generation and title jobs (detached tasks with durable
//!   job records)
//! - Live delta fan-out (StreamRegistry)
//! - Event streaming to embedders

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};

use llm::{ChatModel, ModelRegistry};

use crate::config::{EngineConfig, ModelCatalogEntry};
use crate::error::ChatError;
use crate::guard::{authorize, IdentityProvider};
use crate::ledger::MessageLedger;
use crate::read::{MessagePage, MessageQuery, ThreadReader};
use crate::retry::execute_retry;
use crate::storage::{
    unix_timestamp_ms, JobId, JobKind, JobRecord, JobStatus, Message, MessageId, Thread, ThreadId,
    ThreadStore, ThreadSummary, UserId,
};
use crate::stream::{
    GenerationJob, StreamDelta, StreamOutcome, StreamRegistry, StreamSnapshot, StreamTuning,
};
use crate::title::{TitleJob, PLACEHOLDER_TITLE};

/// Type alias for the shared event sender - events go out as
/// `(ThreadId, ThreadEvent)` tuples for centralized dispatch.
pub type SharedEventSender = mpsc::UnboundedSender<(ThreadId, ThreadEvent)>;

/// Events emitted by the engine and its background jobs
#[derive(Debug, Clone)]
pub enum ThreadEvent {
    /// User message persisted (immediate feedback, before generation runs)
    UserMessageAdded { message_id: MessageId },
    /// Next slice of assistant text; `cursor` is the total length after
    /// applying the delta
    AssistantDelta {
        message_id: MessageId,
        cursor: u64,
        delta: String,
    },
    /// Assistant message committed
    AssistantCompleted { message_id: MessageId },
    /// Assistant message failed; any flushed partial text stays on it
    AssistantFailed { message_id: MessageId, reason: String },
    /// Thread title changed (title job or explicit rename)
    TitleUpdated { title: String },
    /// Thread and all of its messages removed
    ThreadDeleted,
}

// ============================================================================
// ChatService
// ============================================================================

/// Thread engine facade.
///
/// Every operation resolves the caller through the configured
/// [`IdentityProvider`] and checks thread ownership before touching
/// anything. Generation and titling run as detached tasks; their progress
/// reaches callers through the event channel, the live stream registry,
/// and ultimately the store.
pub struct ChatService {
    store: Arc<dyn ThreadStore>,
    ledger: MessageLedger,
    registry: StreamRegistry,
    reader: ThreadReader,
    models: ModelRegistry,
    identity: Arc<dyn IdentityProvider>,
    config: Arc<EngineConfig>,
    events: SharedEventSender,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<(ThreadId, ThreadEvent)>>>,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn ThreadStore>,
        models: ModelRegistry,
        identity: Arc<dyn IdentityProvider>,
        config: EngineConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let config = Arc::new(config);
        let registry = StreamRegistry::new();
        let reader = ThreadReader::new(Arc::clone(&store), registry.clone(), Arc::clone(&config));

        Self {
            ledger: MessageLedger::new(Arc::clone(&store)),
            store,
            registry,
            reader,
            models,
            identity,
            config,
            events: event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Take the engine-wide event stream. There is a single receiver; a
    /// second call returns `None`.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<(ThreadId, ThreadEvent)>> {
        self.event_rx.lock().unwrap().take()
    }

    /// Models offered to pickers. Data only; any id the registry resolves
    /// is accepted whether or not it appears here.
    pub fn list_models(&self) -> &[ModelCatalogEntry] {
        &self.config.catalog
    }

    // ========================================================================
    // Thread operations
    // ========================================================================

    /// Create a thread from its first user message and start generating the
    /// reply. Returns the thread id and the assistant placeholder id (the
    /// message a client polls or follows).
    ///
    /// The thread starts under a placeholder title; a background job names
    /// it from the first message.
    pub async fn create_thread(
        &self,
        prompt: &str,
        model_override: Option<&str>,
    ) -> Result<(ThreadId, MessageId), ChatError> {
        let caller = self.caller().await.ok_or(ChatError::Unauthorized)?;
        let prompt = non_empty(prompt, "prompt")?;
        let (model_id, model) = self.resolve_model(model_override)?;

        let thread = self.store.create_thread(&caller, PLACEHOLDER_TITLE).await?;
        tracing::info!(thread_id = %thread.id, model = %model_id, "thread created");

        let user_message = self.ledger.append_user_message(&thread.id, prompt).await?;
        let placeholder = self.ledger.append_placeholder(&thread.id, &model_id).await?;
        let _ = self.events.send((
            thread.id.clone(),
            ThreadEvent::UserMessageAdded {
                message_id: user_message.id.clone(),
            },
        ));

        self.spawn_generation(&thread.id, &placeholder, model).await?;
        self.spawn_title(&thread.id, &user_message).await?;

        Ok((thread.id, placeholder.id))
    }

    /// Append a user message to an existing thread and start generating the
    /// reply. Returns the assistant placeholder id.
    pub async fn send_message(
        &self,
        thread_id: &ThreadId,
        prompt: &str,
        model_override: Option<&str>,
    ) -> Result<MessageId, ChatError> {
        let caller = self.caller().await;
        authorize(self.store.as_ref(), caller.as_ref(), thread_id).await?;
        let prompt = non_empty(prompt, "prompt")?;
        let (model_id, model) = self.resolve_model(model_override)?;

        let user_message = self.ledger.append_user_message(thread_id, prompt).await?;
        let placeholder = self.ledger.append_placeholder(thread_id, &model_id).await?;
        let _ = self.events.send((
            thread_id.clone(),
            ThreadEvent::UserMessageAdded {
                message_id: user_message.id.clone(),
            },
        ));

        self.spawn_generation(thread_id, &placeholder, model).await?;
        Ok(placeholder.id)
    }

    /// Regenerate a settled assistant message, optionally on a different
    /// model. The old message is superseded, its prompting user turn is
    /// re-appended, and a fresh placeholder starts streaming. Returns the
    /// new placeholder id.
    pub async fn retry_message(
        &self,
        thread_id: &ThreadId,
        message_id: &MessageId,
        model_override: Option<&str>,
    ) -> Result<MessageId, ChatError> {
        let caller = self.caller().await;
        authorize(self.store.as_ref(), caller.as_ref(), thread_id).await?;

        // Reject a bad explicit model before mutating the thread.
        if let Some(id) = model_override {
            if self.models.model(id).is_none() {
                return Err(ChatError::InvalidArgument(format!("unknown model {id}")));
            }
        }

        let original = self
            .store
            .get_message(message_id)
            .await?
            .filter(|m| &m.thread_id == thread_id)
            .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))?;

        let outcome = execute_retry(
            self.store.as_ref(),
            &self.ledger,
            &self.config,
            &original,
            model_override,
        )
        .await?;
        let _ = self.events.send((
            thread_id.clone(),
            ThreadEvent::UserMessageAdded {
                message_id: outcome.user_message.id.clone(),
            },
        ));

        let model = match self.models.model(&outcome.model) {
            Some(model) => model,
            None => {
                // The inherited model id no longer resolves (provider set
                // changed since it was recorded). Settle the placeholder
                // rather than leaving it pending forever.
                tracing::warn!(model = %outcome.model, "retry model no longer resolves");
                let _ = self.ledger.fail(&outcome.placeholder.id, None).await;
                return Err(ChatError::InvalidArgument(format!(
                    "unknown model {}",
                    outcome.model
                )));
            }
        };

        self.spawn_generation(thread_id, &outcome.placeholder, model)
            .await?;
        Ok(outcome.placeholder.id)
    }

    /// Threads owned by the caller, newest first.
    pub async fn list_threads(&self) -> Result<Vec<ThreadSummary>, ChatError> {
        let caller = self.caller().await.ok_or(ChatError::Unauthorized)?;
        let threads = self
            .store
            .list_threads(&caller, self.config.thread_page_size)
            .await?;
        Ok(threads)
    }

    pub async fn get_thread(&self, thread_id: &ThreadId) -> Result<Thread, ChatError> {
        let caller = self.caller().await;
        authorize(self.store.as_ref(), caller.as_ref(), thread_id).await
    }

    /// One page of a thread, oldest first, with live text merged in for
    /// messages still streaming.
    pub async fn list_messages(
        &self,
        thread_id: &ThreadId,
        query: &MessageQuery,
    ) -> Result<MessagePage, ChatError> {
        let caller = self.caller().await;
        authorize(self.store.as_ref(), caller.as_ref(), thread_id).await?;
        self.reader.list_messages(thread_id, query).await
    }

    /// Attach to a message's live stream: the text accumulated so far plus
    /// a subscription for the deltas that follow. The message must belong
    /// to the given thread; `None` when it has no active stream (settled,
    /// or not started).
    pub async fn follow_message(
        &self,
        thread_id: &ThreadId,
        message_id: &MessageId,
    ) -> Result<Option<(StreamSnapshot, broadcast::Receiver<StreamDelta>)>, ChatError> {
        let caller = self.caller().await;
        authorize(self.store.as_ref(), caller.as_ref(), thread_id).await?;
        let message = self
            .store
            .get_message(message_id)
            .await?
            .filter(|m| &m.thread_id == thread_id)
            .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))?;
        Ok(self.registry.subscribe(&message.id))
    }

    /// Explicit rename. The title job never overwrites an explicit rename
    /// once the placeholder title is gone, because it only runs at thread
    /// creation.
    pub async fn rename_thread(&self, thread_id: &ThreadId, title: &str) -> Result<(), ChatError> {
        let caller = self.caller().await;
        authorize(self.store.as_ref(), caller.as_ref(), thread_id).await?;
        let title = non_empty(title, "title")?;

        self.store.rename_thread(thread_id, title).await?;
        let _ = self.events.send((
            thread_id.clone(),
            ThreadEvent::TitleUpdated {
                title: title.to_string(),
            },
        ));
        Ok(())
    }

    /// Delete a thread and everything in it, cancelling any in-flight
    /// generation first.
    pub async fn delete_thread(&self, thread_id: &ThreadId) -> Result<(), ChatError> {
        let caller = self.caller().await;
        authorize(self.store.as_ref(), caller.as_ref(), thread_id).await?;

        self.registry.cancel_thread(thread_id);
        self.store.delete_thread(thread_id).await?;
        tracing::info!(thread_id = %thread_id, "thread deleted");
        let _ = self
            .events
            .send((thread_id.clone(), ThreadEvent::ThreadDeleted));
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn caller(&self) -> Option<UserId> {
        self.identity.caller_identity().await
    }

    /// Resolve the requested model id (or the configured default) to a
    /// backend before any state changes.
    fn resolve_model(
        &self,
        requested: Option<&str>,
    ) -> Result<(String, Arc<dyn ChatModel + Send + Sync>), ChatError> {
        let id = requested.unwrap_or(&self.config.default_model);
        let model = self
            .models
            .model(id)
            .ok_or_else(|| ChatError::InvalidArgument(format!("unknown model {id}")))?;
        Ok((id.to_string(), model))
    }

    fn job_record(&self, kind: JobKind, thread_id: &ThreadId, message_id: &MessageId) -> JobRecord {
        let now = unix_timestamp_ms();
        JobRecord {
            id: JobId::new(),
            kind,
            thread_id: thread_id.clone(),
            message_id: message_id.clone(),
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record the durable job row, then run generation as a detached task.
    /// Status updates after the spawn are best-effort; the row disappears
    /// with its thread on cascade delete.
    async fn spawn_generation(
        &self,
        thread_id: &ThreadId,
        placeholder: &Message,
        model: Arc<dyn ChatModel + Send + Sync>,
    ) -> Result<(), ChatError> {
        let job = self.job_record(JobKind::Generate, thread_id, &placeholder.id);
        self.store.record_job(&job).await?;

        let generation = GenerationJob {
            store: Arc::clone(&self.store),
            registry: self.registry.clone(),
            model,
            events: self.events.clone(),
            tuning: StreamTuning::from_config(&self.config),
            system_prompt: self.config.system_prompt.clone(),
            thread_id: thread_id.clone(),
            message_id: placeholder.id.clone(),
        };
        let store = Arc::clone(&self.store);
        let job_id = job.id;
        tokio::spawn(async move {
            let _ = store.update_job_status(&job_id, JobStatus::Running).await;
            let outcome = generation.run().await;
            let status = match outcome {
                StreamOutcome::Completed => JobStatus::Succeeded,
                StreamOutcome::Failed | StreamOutcome::Aborted => JobStatus::Failed,
            };
            let _ = store.update_job_status(&job_id, status).await;
        });
        Ok(())
    }

    /// Record the durable job row, then name the thread as a detached task.
    async fn spawn_title(
        &self,
        thread_id: &ThreadId,
        user_message: &Message,
    ) -> Result<(), ChatError> {
        let job = self.job_record(JobKind::Title, thread_id, &user_message.id);
        self.store.record_job(&job).await?;

        // No resolvable title model is fine; the job falls back to the
        // first words of the message.
        let title = TitleJob {
            store: Arc::clone(&self.store),
            model: self.models.model(self.config.title_model()),
            events: self.events.clone(),
            thread_id: thread_id.clone(),
            message: user_message.content.clone(),
        };
        let store = Arc::clone(&self.store);
        let job_id = job.id;
        tokio::spawn(async move {
            let _ = store.update_job_status(&job_id, JobStatus::Running).await;
            let status = if title.run().await {
                JobStatus::Succeeded
            } else {
                JobStatus::Failed
            };
            let _ = store.update_job_status(&job_id, status).await;
        });
        Ok(())
    }
}

fn non_empty<'a>(value: &'a str, what: &str) -> Result<&'a str, ChatError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ChatError::InvalidArgument(format!(
            "{what} must not be empty"
        )));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::{Anonymous, IdentityProvider, StaticIdentity};
    use crate::storage::{MemoryStore, MessageRole, MessageStatus};
    use async_trait::async_trait;
    use futures::{stream, StreamExt};
    use llm::{ChatChunk, ChatMessage, ChatRequest, ChatStream, ModelDefinition, ModelProvider};
    use std::time::Duration;

    const TITLE_REPLY: &str = "Mock Thread Title";

    struct ScriptedModel {
        id: String,
        chunks: Vec<&'static str>,
        hang: bool,
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn name(&self) -> &str {
            &self.id
        }

        async fn chat(&self, _request: &ChatRequest) -> anyhow::Result<ChatMessage> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(ChatMessage::assistant(TITLE_REPLY))
        }

        async fn stream_chat(&self, _request: &ChatRequest) -> anyhow::Result<ChatStream> {
            let chunks: Vec<anyhow::Result<ChatChunk>> = self
                .chunks
                .iter()
                .map(|c| Ok(ChatChunk::assistant(*c)))
                .collect();
            if self.hang {
                Ok(Box::pin(stream::iter(chunks).chain(stream::pending())))
            } else {
                Ok(Box::pin(stream::iter(chunks)))
            }
        }
    }

    struct ScriptedProvider {
        known: Vec<String>,
        chunks: Vec<&'static str>,
        hang: bool,
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        async fn list_models(&self) -> anyhow::Result<Vec<ModelDefinition>> {
            Ok(self.known.iter().map(ModelDefinition::new).collect())
        }

        fn create_chat_model(&self, model_name: &str) -> Option<Arc<dyn ChatModel + Send + Sync>> {
            if !self.known.iter().any(|k| k == model_name) {
                return None;
            }
            Some(Arc::new(ScriptedModel {
                id: model_name.to_string(),
                chunks: self.chunks.clone(),
                hang: self.hang,
            }))
        }
    }

    struct Harness {
        service: ChatService,
        store: Arc<MemoryStore>,
        events: mpsc::UnboundedReceiver<(ThreadId, ThreadEvent)>,
    }

    fn harness_for(chunks: Vec<&'static str>, hang: bool) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let models = ModelRegistry::new().with_provider(
            "mock",
            Arc::new(ScriptedProvider {
                known: vec!["gemini-2.5-flash".to_string(), "other-model".to_string()],
                chunks,
                hang,
            }),
        );
        let config = EngineConfig {
            throttle_ms: 0,
            ..Default::default()
        };
        let service = ChatService::new(
            store.clone(),
            models,
            Arc::new(StaticIdentity(UserId::from_string("alice"))),
            config,
        );
        let events = service.take_events().unwrap();
        Harness {
            service,
            store,
            events,
        }
    }

    fn harness() -> Harness {
        harness_for(vec!["Hello ", "world"], false)
    }

    /// Collect events until the given assistant message settles and the
    /// thread has been titled.
    async fn drain_until_settled(
        events: &mut mpsc::UnboundedReceiver<(ThreadId, ThreadEvent)>,
        message_id: &MessageId,
        expect_title: bool,
    ) -> Vec<ThreadEvent> {
        let mut seen = Vec::new();
        let mut settled = false;
        let mut titled = !expect_title;
        while !(settled && titled) {
            let (_, event) = events.recv().await.unwrap();
            match &event {
                ThreadEvent::AssistantCompleted { message_id: id }
                | ThreadEvent::AssistantFailed { message_id: id, .. }
                    if id == message_id =>
                {
                    settled = true;
                }
                ThreadEvent::TitleUpdated { .. } => titled = true,
                _ => {}
            }
            seen.push(event);
        }
        seen
    }

    async fn wait_for_job(
        store: &MemoryStore,
        message_id: &MessageId,
        kind: JobKind,
        status: JobStatus,
    ) -> bool {
        for _ in 0..100 {
            if let Some(job) = store.job_for_message(message_id, kind).await.unwrap() {
                if job.status == status {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_create_thread_streams_and_titles() {
        let mut h = harness();
        let (thread_id, placeholder_id) =
            h.service.create_thread("hi there", None).await.unwrap();

        let events = drain_until_settled(&mut h.events, &placeholder_id, true).await;

        let mut streamed = String::new();
        let mut user_id = None;
        for event in &events {
            match event {
                ThreadEvent::UserMessageAdded { message_id } => {
                    user_id = Some(message_id.clone())
                }
                ThreadEvent::AssistantDelta { delta, .. } => streamed.push_str(delta),
                ThreadEvent::TitleUpdated { title } => assert_eq!(title, TITLE_REPLY),
                _ => {}
            }
        }
        assert_eq!(streamed, "Hello world");

        let page = h
            .service
            .list_messages(&thread_id, &MessageQuery::default())
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 2);
        assert_eq!(page.messages[0].message.role, MessageRole::User);
        assert_eq!(page.messages[0].message.content, "hi there");
        assert_eq!(page.messages[1].message.status, MessageStatus::Complete);
        assert_eq!(page.messages[1].message.content, "Hello world");
        assert_eq!(
            page.messages[1].message.model.as_deref(),
            Some("gemini-2.5-flash")
        );

        let thread = h.service.get_thread(&thread_id).await.unwrap();
        assert_eq!(thread.title, TITLE_REPLY);

        assert!(
            wait_for_job(&h.store, &placeholder_id, JobKind::Generate, JobStatus::Succeeded).await
        );
        assert!(
            wait_for_job(
                &h.store,
                &user_id.unwrap(),
                JobKind::Title,
                JobStatus::Succeeded
            )
            .await
        );
    }

    #[tokio::test]
    async fn test_send_message_continues_thread() {
        let mut h = harness();
        let (thread_id, first) = h.service.create_thread("first question", None).await.unwrap();
        drain_until_settled(&mut h.events, &first, true).await;

        let second = h
            .service
            .send_message(&thread_id, "second question", Some("other-model"))
            .await
            .unwrap();
        drain_until_settled(&mut h.events, &second, false).await;

        let page = h
            .service
            .list_messages(&thread_id, &MessageQuery::default())
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 4);
        let seqs: Vec<i64> = page.messages.iter().map(|v| v.message.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(page.messages[3].message.id, second);
        assert_eq!(page.messages[3].message.model.as_deref(), Some("other-model"));
    }

    #[tokio::test]
    async fn test_retry_supersedes_and_regenerates() {
        let mut h = harness();
        let (thread_id, first) = h.service.create_thread("explain rust", None).await.unwrap();
        drain_until_settled(&mut h.events, &first, true).await;

        let second = h
            .service
            .retry_message(&thread_id, &first, Some("other-model"))
            .await
            .unwrap();
        assert_ne!(second, first);
        drain_until_settled(&mut h.events, &second, false).await;

        let page = h
            .service
            .list_messages(&thread_id, &MessageQuery::default())
            .await
            .unwrap();
        let contents: Vec<&str> = page
            .messages
            .iter()
            .map(|v| v.message.content.as_str())
            .collect();
        assert_eq!(contents, vec!["explain rust", "explain rust", "Hello world"]);
        assert_eq!(page.messages[2].message.model.as_deref(), Some("other-model"));

        let audit = h
            .service
            .list_messages(
                &thread_id,
                &MessageQuery {
                    include_superseded: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(audit.messages.len(), 4);
        assert_eq!(audit.messages[1].message.status, MessageStatus::Superseded);
    }

    #[tokio::test]
    async fn test_delete_thread_cancels_inflight_stream() {
        let mut h = harness_for(vec!["start "], true);
        let (thread_id, placeholder_id) =
            h.service.create_thread("never finishes", None).await.unwrap();

        // Wait until text is actually flowing before pulling the thread.
        loop {
            let (_, event) = h.events.recv().await.unwrap();
            if matches!(event, ThreadEvent::AssistantDelta { .. }) {
                break;
            }
        }

        h.service.delete_thread(&thread_id).await.unwrap();

        let err = h.service.get_thread(&thread_id).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        assert!(h.store.get_message(&placeholder_id).await.unwrap().is_none());
        assert!(h.service.list_threads().await.unwrap().is_empty());

        // The driver notices the cancel and lets go of the session.
        for _ in 0..100 {
            if !h.service.registry.is_live(&placeholder_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("stream session survived thread deletion");
    }

    #[tokio::test]
    async fn test_follow_message_merges_midstream() {
        let mut h = harness_for(vec!["alpha ", "beta"], true);
        let (thread_id, placeholder_id) =
            h.service.create_thread("stream forever", None).await.unwrap();

        let mut first_cursor = 0;
        loop {
            let (_, event) = h.events.recv().await.unwrap();
            if let ThreadEvent::AssistantDelta { cursor, .. } = event {
                first_cursor = cursor;
                break;
            }
        }

        let (snapshot, _deltas) = h
            .service
            .follow_message(&thread_id, &placeholder_id)
            .await
            .unwrap()
            .expect("stream is live");
        assert!(snapshot.cursor >= first_cursor);
        assert!(snapshot.text.starts_with("alpha"));

        h.service.delete_thread(&thread_id).await.unwrap();
    }

    /// An identity that can be swapped mid-test, so one service (and one
    /// stream registry) serves calls from different users.
    struct SwitchableIdentity(Mutex<UserId>);

    #[async_trait]
    impl IdentityProvider for SwitchableIdentity {
        async fn caller_identity(&self) -> Option<UserId> {
            Some(self.0.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn test_follow_message_rejects_foreign_message_id() {
        let store = Arc::new(MemoryStore::new());
        let models = ModelRegistry::new().with_provider(
            "mock",
            Arc::new(ScriptedProvider {
                known: vec!["gemini-2.5-flash".to_string()],
                chunks: vec!["secret "],
                hang: true,
            }),
        );
        let identity = Arc::new(SwitchableIdentity(Mutex::new(UserId::from_string("alice"))));
        let config = EngineConfig {
            throttle_ms: 0,
            ..Default::default()
        };
        let service = ChatService::new(store, models, identity.clone(), config);
        let mut events = service.take_events().unwrap();

        let (alice_thread, alice_placeholder) =
            service.create_thread("private notes", None).await.unwrap();
        // Wait until alice's stream is live and carrying text.
        loop {
            let (_, event) = events.recv().await.unwrap();
            if matches!(event, ThreadEvent::AssistantDelta { .. }) {
                break;
            }
        }

        // Mallory owns a thread of their own but names alice's message.
        // Owning some thread must not grant a window into another one.
        *identity.0.lock().unwrap() = UserId::from_string("mallory");
        let (mallory_thread, _) = service.create_thread("unrelated", None).await.unwrap();
        let err = service
            .follow_message(&mallory_thread, &alice_placeholder)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));

        // The owner still attaches through the right thread.
        *identity.0.lock().unwrap() = UserId::from_string("alice");
        let live = service
            .follow_message(&alice_thread, &alice_placeholder)
            .await
            .unwrap();
        let (snapshot, _deltas) = live.expect("stream is live");
        assert!(snapshot.text.starts_with("secret"));
    }

    #[tokio::test]
    async fn test_empty_prompt_rejected() {
        let h = harness();
        let err = h.service.create_thread("   ", None).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidArgument(_)));
        assert!(h.service.list_threads().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_model_rejected_before_writes() {
        let h = harness();
        let err = h
            .service
            .create_thread("hi", Some("missing-model"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidArgument(_)));
        assert!(h.service.list_threads().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_thread() {
        let mut h = harness();
        let (thread_id, first) = h.service.create_thread("hello", None).await.unwrap();
        drain_until_settled(&mut h.events, &first, true).await;

        h.service
            .rename_thread(&thread_id, "  My Notes  ")
            .await
            .unwrap();
        let thread = h.service.get_thread(&thread_id).await.unwrap();
        assert_eq!(thread.title, "My Notes");

        let err = h
            .service
            .rename_thread(&thread_id, "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_anonymous_caller_unauthorized() {
        let store = Arc::new(MemoryStore::new());
        let service = ChatService::new(
            store,
            ModelRegistry::new(),
            Arc::new(Anonymous),
            EngineConfig::default(),
        );
        let err = service.create_thread("hi", None).await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized));
        let err = service.list_threads().await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized));
    }

    #[tokio::test]
    async fn test_foreign_thread_unauthorized() {
        let mut h = harness();
        let (thread_id, first) = h.service.create_thread("mine", None).await.unwrap();
        drain_until_settled(&mut h.events, &first, true).await;

        let intruder = ChatService::new(
            h.store.clone(),
            ModelRegistry::new(),
            Arc::new(StaticIdentity(UserId::from_string("mallory"))),
            EngineConfig::default(),
        );
        let err = intruder.get_thread(&thread_id).await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized));
        let err = intruder.delete_thread(&thread_id).await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized));

        // Still there for the owner
        assert!(h.service.get_thread(&thread_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_new_thread_starts_with_placeholder_title() {
        // Both model calls hang, so the title job never finishes and the
        // placeholder title stays visible.
        let h = harness_for(vec![], true);
        let (thread_id, _) = h.service.create_thread("hi", None).await.unwrap();

        let thread = h.service.get_thread(&thread_id).await.unwrap();
        assert_eq!(thread.title, PLACEHOLDER_TITLE);
        assert_eq!(thread.title, "Generating title...");
    }

    #[tokio::test]
    async fn test_take_events_is_single_shot() {
        let h = harness();
        assert!(h.service.take_events().is_none());
    }

    #[tokio::test]
    async fn test_list_models_serves_catalog() {
        let h = harness();
        let catalog = h.service.list_models();
        assert_eq!(catalog.len(), 3);
        assert!(catalog.iter().any(|m| m.id == "gemini-2.5-flash"));
        assert!(catalog.iter().all(|m| m.provider == "Google"));
    }
}
