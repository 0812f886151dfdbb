//! In-memory thread storage
//!
//! This is the default storage backend - fast but not persistent. It is also
//! the store the engine tests run against.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::ids::{JobId, MessageId, ThreadId, UserId};
use super::traits::ThreadStore;
use super::types::{
    JobKind, JobRecord, JobStatus, Message, MessageRole, MessageStatus, StoreError, Thread,
    ThreadSummary,
};
use super::unix_timestamp_ms;

#[derive(Default)]
struct Inner {
    threads: HashMap<ThreadId, Thread>,
    messages: HashMap<MessageId, Message>,
    jobs: HashMap<JobId, JobRecord>,
    next_seq: HashMap<ThreadId, i64>,
}

impl Inner {
    fn thread_messages(&self, thread_id: &ThreadId) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .messages
            .values()
            .filter(|m| &m.thread_id == thread_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.seq);
        messages
    }
}

/// In-memory thread storage
///
/// Fast but not persistent - threads are lost when the store is dropped.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ThreadStore for MemoryStore {
    async fn create_thread(&self, owner: &UserId, title: &str) -> Result<Thread, StoreError> {
        let now = unix_timestamp_ms();
        let thread = Thread {
            id: ThreadId::new(),
            owner: owner.clone(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };

        let mut inner = self.inner.lock().unwrap();
        inner.next_seq.insert(thread.id.clone(), 0);
        inner.threads.insert(thread.id.clone(), thread.clone());
        Ok(thread)
    }

    async fn get_thread(&self, thread_id: &ThreadId) -> Result<Option<Thread>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.threads.get(thread_id).cloned())
    }

    async fn list_threads(
        &self,
        owner: &UserId,
        limit: usize,
    ) -> Result<Vec<ThreadSummary>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut threads: Vec<&Thread> = inner
            .threads
            .values()
            .filter(|t| &t.owner == owner)
            .collect();
        // created_at ties are broken by id so the order is deterministic
        threads.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.as_str().cmp(a.id.as_str()))
        });
        threads.truncate(limit);

        Ok(threads
            .into_iter()
            .map(|t| ThreadSummary {
                id: t.id.clone(),
                title: t.title.clone(),
                message_count: inner
                    .messages
                    .values()
                    .filter(|m| m.thread_id == t.id)
                    .count(),
                created_at: t.created_at,
                updated_at: t.updated_at,
            })
            .collect())
    }

    async fn rename_thread(&self, thread_id: &ThreadId, title: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let thread = inner
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;
        thread.title = title.to_string();
        thread.updated_at = unix_timestamp_ms();
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &ThreadId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .threads
            .remove(thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;
        inner.messages.retain(|_, m| &m.thread_id != thread_id);
        inner.jobs.retain(|_, j| &j.thread_id != thread_id);
        inner.next_seq.remove(thread_id);
        Ok(())
    }

    async fn append_message(
        &self,
        thread_id: &ThreadId,
        role: MessageRole,
        content: &str,
        status: MessageStatus,
        model: Option<&str>,
    ) -> Result<Message, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.threads.contains_key(thread_id) {
            return Err(StoreError::ThreadNotFound(thread_id.to_string()));
        }

        let seq = {
            let counter = inner.next_seq.entry(thread_id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        let now = unix_timestamp_ms();
        let message = Message {
            id: MessageId::new(),
            thread_id: thread_id.clone(),
            role,
            seq,
            content: content.to_string(),
            status,
            model: model.map(|m| m.to_string()),
            created_at: now,
            updated_at: now,
        };
        inner.messages.insert(message.id.clone(), message.clone());
        if let Some(thread) = inner.threads.get_mut(thread_id) {
            thread.updated_at = now;
        }
        Ok(message)
    }

    async fn get_message(&self, message_id: &MessageId) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.messages.get(message_id).cloned())
    }

    async fn message_at(
        &self,
        thread_id: &ThreadId,
        seq: i64,
    ) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .messages
            .values()
            .find(|m| &m.thread_id == thread_id && m.seq == seq)
            .cloned())
    }

    async fn transition_status(
        &self,
        message_id: &MessageId,
        expected: &[MessageStatus],
        next: MessageStatus,
        content: Option<&str>,
    ) -> Result<Message, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let message = inner
            .messages
            .get_mut(message_id)
            .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;

        if !expected.contains(&message.status) {
            return Err(StoreError::Conflict {
                actual: message.status,
            });
        }

        message.status = next;
        if let Some(content) = content {
            message.content = content.to_string();
        }
        message.updated_at = unix_timestamp_ms();
        Ok(message.clone())
    }

    async fn list_messages(
        &self,
        thread_id: &ThreadId,
        after_seq: Option<i64>,
        limit: usize,
        include_superseded: bool,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().unwrap();
        if !inner.threads.contains_key(thread_id) {
            return Err(StoreError::ThreadNotFound(thread_id.to_string()));
        }

        let mut messages = inner.thread_messages(thread_id);
        messages.retain(|m| {
            (include_superseded || m.status != MessageStatus::Superseded)
                && after_seq.map_or(true, |after| m.seq > after)
        });
        messages.truncate(limit);
        Ok(messages)
    }

    async fn last_model(&self, thread_id: &ThreadId) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .thread_messages(thread_id)
            .into_iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant && m.model.is_some())
            .and_then(|m| m.model))
    }

    async fn record_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_job_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        job.status = status;
        job.updated_at = unix_timestamp_ms();
        Ok(())
    }

    async fn job_for_message(
        &self,
        message_id: &MessageId,
        kind: JobKind,
    ) -> Result<Option<JobRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|j| &j.message_id == message_id && j.kind == kind)
            .max_by_key(|j| j.created_at)
            .cloned())
    }
}
