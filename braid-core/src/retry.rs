//! Retrying an assistant response
//!
//! A retry replaces a finished (complete or failed) assistant message with
//! a fresh attempt. The old message is kept for audit but marked
//! `superseded`; the user text that prompted it is appended again as a new
//! turn, followed by a new placeholder that a generation job then fills.
//! History for the new attempt is rebuilt at generation time, so the
//! superseded response never feeds back into the model.

use crate::config::EngineConfig;
use crate::error::ChatError;
use crate::ledger::MessageLedger;
use crate::storage::{Message, MessageRole, ThreadStore};

/// What a retry appended, ready for job scheduling.
#[derive(Debug)]
pub struct RetryOutcome {
    /// Fresh copy of the prompting user turn.
    pub user_message: Message,
    /// New assistant placeholder, already tagged with `model`.
    pub placeholder: Message,
    /// Model the new attempt will use.
    pub model: String,
}

/// Supersede `original` and append the replacement pair.
///
/// The prompting user turn is found by ordering key: it must sit directly
/// before the assistant message being retried. The model for the new
/// attempt is the explicit override if given, otherwise the thread's last
/// used model (the superseded attempt counts), otherwise the configured
/// default.
pub async fn execute_retry(
    store: &dyn ThreadStore,
    ledger: &MessageLedger,
    config: &EngineConfig,
    original: &Message,
    model_override: Option<&str>,
) -> Result<RetryOutcome, ChatError> {
    if original.role != MessageRole::Assistant {
        return Err(ChatError::NotFound(format!(
            "no retryable assistant message {}",
            original.id
        )));
    }
    if !original.status.is_terminal() {
        // Still pending or streaming; a second generation against the same
        // prompt would race the one in flight.
        return Err(ChatError::InvalidTransition {
            actual: original.status,
        });
    }

    let preceding = store
        .message_at(&original.thread_id, original.seq - 1)
        .await?
        .filter(|m| m.role == MessageRole::User)
        .ok_or_else(|| {
            ChatError::NotFound(format!(
                "no user message preceding {} in thread {}",
                original.id, original.thread_id
            ))
        })?;

    ledger.supersede(&original.id).await?;

    let model = match model_override {
        Some(model) => model.to_string(),
        None => store
            .last_model(&original.thread_id)
            .await?
            .unwrap_or_else(|| config.default_model.clone()),
    };

    let user_message = ledger
        .append_user_message(&original.thread_id, &preceding.content)
        .await?;
    let placeholder = ledger
        .append_placeholder(&original.thread_id, &model)
        .await?;

    Ok(RetryOutcome {
        user_message,
        placeholder,
        model,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, MessageStatus, ThreadId, UserId};
    use std::sync::Arc;

    struct Fixture {
        store: Arc<MemoryStore>,
        ledger: MessageLedger,
        config: EngineConfig,
        thread_id: ThreadId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let thread = store
            .create_thread(&UserId::from_string("u"), "t")
            .await
            .unwrap();
        Fixture {
            ledger: MessageLedger::new(store.clone()),
            store,
            config: EngineConfig::default(),
            thread_id: thread.id,
        }
    }

    /// One completed user/assistant exchange; returns the assistant message.
    async fn exchange(fix: &Fixture, prompt: &str, answer: &str, model: Option<&str>) -> Message {
        fix.ledger
            .append_user_message(&fix.thread_id, prompt)
            .await
            .unwrap();
        let placeholder = fix
            .ledger
            .append_placeholder(&fix.thread_id, model.unwrap_or("gemini-2.5-flash"))
            .await
            .unwrap();
        fix.ledger.commit(&placeholder.id, answer).await.unwrap()
    }

    #[tokio::test]
    async fn test_retry_supersedes_and_duplicates_prompt() {
        let fix = fixture().await;
        let original = exchange(&fix, "what is rust", "a language", None).await;

        let outcome = execute_retry(
            fix.store.as_ref(),
            &fix.ledger,
            &fix.config,
            &original,
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.user_message.content, "what is rust");
        assert_eq!(outcome.user_message.role, MessageRole::User);
        assert_eq!(outcome.placeholder.status, MessageStatus::Pending);
        assert!(outcome.placeholder.seq > outcome.user_message.seq);

        let superseded = fix
            .store
            .get_message(&original.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(superseded.status, MessageStatus::Superseded);
        // Superseded text is kept for audit
        assert_eq!(superseded.content, "a language");

        // Default listing hides the superseded attempt but keeps both user
        // turns
        let visible = fix
            .store
            .list_messages(&fix.thread_id, None, 100, false)
            .await
            .unwrap();
        let contents: Vec<&str> = visible.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["what is rust", "what is rust", ""]);
    }

    #[tokio::test]
    async fn test_retry_reuses_last_model() {
        let fix = fixture().await;
        let original = exchange(&fix, "q", "a", Some("gemini-2.5-pro")).await;

        let outcome = execute_retry(
            fix.store.as_ref(),
            &fix.ledger,
            &fix.config,
            &original,
            None,
        )
        .await
        .unwrap();
        assert_eq!(outcome.model, "gemini-2.5-pro");
        assert_eq!(outcome.placeholder.model.as_deref(), Some("gemini-2.5-pro"));
    }

    #[tokio::test]
    async fn test_retry_with_override() {
        let fix = fixture().await;
        let original = exchange(&fix, "q", "a", Some("gemini-2.5-pro")).await;

        let outcome = execute_retry(
            fix.store.as_ref(),
            &fix.ledger,
            &fix.config,
            &original,
            Some("gemini-2.5-flash-lite-preview-06-17"),
        )
        .await
        .unwrap();
        assert_eq!(outcome.model, "gemini-2.5-flash-lite-preview-06-17");
    }

    #[tokio::test]
    async fn test_retry_falls_back_to_default_model() {
        let fix = fixture().await;
        // An exchange whose assistant message carries no model tag
        fix.ledger
            .append_user_message(&fix.thread_id, "q")
            .await
            .unwrap();
        let original = fix
            .store
            .append_message(
                &fix.thread_id,
                MessageRole::Assistant,
                "a",
                MessageStatus::Complete,
                None,
            )
            .await
            .unwrap();

        let outcome = execute_retry(
            fix.store.as_ref(),
            &fix.ledger,
            &fix.config,
            &original,
            None,
        )
        .await
        .unwrap();
        assert_eq!(outcome.model, fix.config.default_model);
    }

    #[tokio::test]
    async fn test_retry_of_failed_message() {
        let fix = fixture().await;
        fix.ledger
            .append_user_message(&fix.thread_id, "q")
            .await
            .unwrap();
        let placeholder = fix
            .ledger
            .append_placeholder(&fix.thread_id, "m")
            .await
            .unwrap();
        let failed = fix.ledger.fail(&placeholder.id, None).await.unwrap();

        let outcome = execute_retry(
            fix.store.as_ref(),
            &fix.ledger,
            &fix.config,
            &failed,
            None,
        )
        .await
        .unwrap();
        assert_eq!(outcome.user_message.content, "q");
    }

    #[tokio::test]
    async fn test_retry_of_inflight_message_is_refused() {
        let fix = fixture().await;
        fix.ledger
            .append_user_message(&fix.thread_id, "q")
            .await
            .unwrap();
        let placeholder = fix
            .ledger
            .append_placeholder(&fix.thread_id, "m")
            .await
            .unwrap();

        let err = execute_retry(
            fix.store.as_ref(),
            &fix.ledger,
            &fix.config,
            &placeholder,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ChatError::InvalidTransition {
                actual: MessageStatus::Pending
            }
        ));

        let streaming = fix
            .ledger
            .begin_streaming(&placeholder.id)
            .await
            .unwrap();
        let err = execute_retry(
            fix.store.as_ref(),
            &fix.ledger,
            &fix.config,
            &streaming,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ChatError::InvalidTransition {
                actual: MessageStatus::Streaming
            }
        ));
    }

    #[tokio::test]
    async fn test_retry_of_user_message_is_refused() {
        let fix = fixture().await;
        let user = fix
            .ledger
            .append_user_message(&fix.thread_id, "q")
            .await
            .unwrap();

        let err = execute_retry(fix.store.as_ref(), &fix.ledger, &fix.config, &user, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_retry_without_preceding_user_is_refused() {
        let fix = fixture().await;
        // Assistant message at the head of the thread
        let orphan = fix
            .store
            .append_message(
                &fix.thread_id,
                MessageRole::Assistant,
                "a",
                MessageStatus::Complete,
                None,
            )
            .await
            .unwrap();

        let err = execute_retry(fix.store.as_ref(), &fix.ledger, &fix.config, &orphan, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));

        // Refusal must not have superseded anything
        let unchanged = fix.store.get_message(&orphan.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, MessageStatus::Complete);
    }
}
