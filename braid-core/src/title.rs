//! Thread title generation
//!
//! New threads start as "Generating title..." and a background job asks a
//! model for something better, derived from the first user message. Title
//! generation is strictly best-effort: whatever goes wrong (backend down,
//! empty answer, thread renamed meanwhile), callers never see an error.
//! The job falls back to a deterministic truncation of the message so the
//! placeholder title never survives the job.

use std::sync::Arc;

use llm::{ChatMessage, ChatModel, ChatRequest};

use crate::engine::{SharedEventSender, ThreadEvent};
use crate::storage::{ThreadId, ThreadStore};

/// Title shown while the title job is still running.
pub const PLACEHOLDER_TITLE: &str = "Generating title...";

/// Title for threads whose first message is blank.
pub const UNTITLED: &str = "New Chat";

const TITLE_SYSTEM_PROMPT: &str = "Generate a concise one-line title (max 6 words) for this \
     conversation. Only return the title, no extra text.";

const FALLBACK_WORDS: usize = 6;

/// Background job that names a freshly created thread.
pub struct TitleJob {
    pub store: Arc<dyn ThreadStore>,
    /// Model to ask; `None` goes straight to the fallback.
    pub model: Option<Arc<dyn ChatModel + Send + Sync>>,
    pub events: SharedEventSender,
    pub thread_id: ThreadId,
    /// First user message of the thread.
    pub message: String,
}

impl TitleJob {
    /// Returns whether a title was written.
    pub async fn run(self) -> bool {
        let title = match &self.model {
            Some(model) => generate_title(model, &self.message).await,
            None => None,
        };
        let title = title.unwrap_or_else(|| fallback_title(&self.message));

        match self.store.rename_thread(&self.thread_id, &title).await {
            Ok(()) => {
                let _ = self
                    .events
                    .send((self.thread_id.clone(), ThreadEvent::TitleUpdated { title }));
                true
            }
            Err(err) => {
                // Thread already gone; nothing to name.
                tracing::warn!(thread_id = %self.thread_id, error = %err, "title not applied");
                false
            }
        }
    }
}

async fn generate_title(
    model: &Arc<dyn ChatModel + Send + Sync>,
    message: &str,
) -> Option<String> {
    let messages = [
        ChatMessage::system(TITLE_SYSTEM_PROMPT),
        ChatMessage::user(format!("Create a short title for: {message}")),
    ];
    let request = ChatRequest::new(&messages);

    match model.chat(&request).await {
        Ok(response) => {
            let title = response.content.trim();
            if title.is_empty() {
                tracing::warn!("title model returned empty text");
                None
            } else {
                Some(title.to_string())
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "title generation failed");
            None
        }
    }
}

/// First words of the message, with an ellipsis when truncated.
pub fn fallback_title(message: &str) -> String {
    let mut words = message.split_whitespace();
    let title: Vec<&str> = words.by_ref().take(FALLBACK_WORDS).collect();
    if title.is_empty() {
        return UNTITLED.to_string();
    }
    let mut title = title.join(" ");
    if words.next().is_some() {
        title.push('\u{2026}');
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, UserId};
    use async_trait::async_trait;
    use futures::stream;
    use llm::{ChatChunk, ChatStream};
    use tokio::sync::mpsc;

    struct TitleModel {
        reply: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl ChatModel for TitleModel {
        fn name(&self) -> &str {
            "title-model"
        }

        async fn chat(&self, request: &ChatRequest) -> anyhow::Result<ChatMessage> {
            if self.fail {
                anyhow::bail!("no backend");
            }
            // The prompt must carry the user's message
            assert!(request
                .messages()
                .iter()
                .any(|m| m.content.starts_with("Create a short title for:")));
            Ok(ChatMessage::assistant(self.reply))
        }

        async fn stream_chat(&self, _request: &ChatRequest) -> anyhow::Result<ChatStream> {
            Ok(Box::pin(stream::iter(vec![Ok(ChatChunk::assistant(
                self.reply,
            ))])))
        }
    }

    fn model(reply: &'static str, fail: bool) -> Option<Arc<dyn ChatModel + Send + Sync>> {
        Some(Arc::new(TitleModel { reply, fail }))
    }

    async fn run_job(
        model: Option<Arc<dyn ChatModel + Send + Sync>>,
        message: &str,
    ) -> (String, bool) {
        let store = Arc::new(MemoryStore::new());
        let thread = store
            .create_thread(&UserId::from_string("u"), PLACEHOLDER_TITLE)
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let applied = TitleJob {
            store: store.clone(),
            model,
            events: tx,
            thread_id: thread.id.clone(),
            message: message.to_string(),
        }
        .run()
        .await;

        if applied {
            let (_, event) = rx.try_recv().unwrap();
            assert!(matches!(event, ThreadEvent::TitleUpdated { .. }));
        }
        let title = store.get_thread(&thread.id).await.unwrap().unwrap().title;
        (title, applied)
    }

    #[tokio::test]
    async fn test_model_title_is_trimmed_and_applied() {
        let (title, applied) = run_job(model("  Rust Questions \n", false), "what is rust").await;
        assert!(applied);
        assert_eq!(title, "Rust Questions");
    }

    #[tokio::test]
    async fn test_backend_failure_falls_back() {
        let (title, applied) = run_job(model("", true), "how do lifetimes work in rust").await;
        assert!(applied);
        assert_eq!(title, "how do lifetimes work in rust");
    }

    #[tokio::test]
    async fn test_empty_reply_falls_back() {
        let (title, _) = run_job(model("   ", false), "hello there").await;
        assert_eq!(title, "hello there");
    }

    #[tokio::test]
    async fn test_no_model_falls_back() {
        let (title, _) = run_job(None, "tell me about the borrow checker today please").await;
        assert_eq!(title, "tell me about the borrow checker\u{2026}");
    }

    #[test]
    fn test_fallback_truncates_at_six_words() {
        assert_eq!(fallback_title("one two three four five six seven"), "one two three four five six\u{2026}");
        assert_eq!(fallback_title("one two three"), "one two three");
        assert_eq!(fallback_title("exactly six words in this message"), "exactly six words in this message");
    }

    #[test]
    fn test_fallback_blank_message() {
        assert_eq!(fallback_title(""), UNTITLED);
        assert_eq!(fallback_title("   \n\t "), UNTITLED);
    }

    #[test]
    fn test_fallback_collapses_whitespace() {
        assert_eq!(fallback_title("  spaced   out\nwords  "), "spaced out words");
    }
}
