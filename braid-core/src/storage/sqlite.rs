//! SQLite-backed thread storage
//!
//! Persistent storage using SQLite. One shared connection guarded by a
//! mutex; the engine only issues short statements so contention stays low.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::ids::{JobId, MessageId, ThreadId, UserId};
use super::traits::ThreadStore;
use super::types::{
    JobKind, JobRecord, JobStatus, Message, MessageRole, MessageStatus, StoreError, Thread,
    ThreadSummary,
};
use super::unix_timestamp_ms;

/// SQLite-backed thread storage
///
/// Open one store per database file and share it across the engine.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(&path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (useful for testing)
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        // Timestamps are INTEGER (epoch milliseconds)
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- Threads
            CREATE TABLE IF NOT EXISTS threads (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                title TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Messages
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
                role TEXT CHECK(role IN ('user', 'assistant')) NOT NULL,
                sequence_number INTEGER NOT NULL,
                content TEXT NOT NULL,
                status TEXT NOT NULL,
                model TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Generation and title jobs
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                kind TEXT CHECK(kind IN ('generate', 'title')) NOT NULL,
                thread_id TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
                message_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_threads_owner ON threads(owner);
            CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id, sequence_number);
            CREATE INDEX IF NOT EXISTS idx_jobs_message ON jobs(message_id);
            "#,
        )?;
        Ok(())
    }
}

fn row_to_thread(row: &rusqlite::Row<'_>) -> rusqlite::Result<Thread> {
    let owner: String = row.get(1)?;
    Ok(Thread {
        id: row.get(0)?,
        owner: UserId::from_string(owner),
        title: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    let status: String = row.get(5)?;
    Ok(Message {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        role: MessageRole::from_str(&role).unwrap_or(MessageRole::Assistant),
        seq: row.get(3)?,
        content: row.get(4)?,
        status: MessageStatus::from_str(&status).unwrap_or(MessageStatus::Failed),
        model: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    let kind: String = row.get(1)?;
    let status: String = row.get(4)?;
    Ok(JobRecord {
        id: row.get(0)?,
        kind: JobKind::from_str(&kind).unwrap_or(JobKind::Generate),
        thread_id: row.get(2)?,
        message_id: row.get(3)?,
        status: JobStatus::from_str(&status).unwrap_or(JobStatus::Failed),
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

const MESSAGE_COLUMNS: &str =
    "id, thread_id, role, sequence_number, content, status, model, created_at, updated_at";

#[async_trait]
impl ThreadStore for SqliteStore {
    async fn create_thread(&self, owner: &UserId, title: &str) -> Result<Thread, StoreError> {
        let conn = self.conn.lock().unwrap();
        let now = unix_timestamp_ms();
        let thread = Thread {
            id: ThreadId::new(),
            owner: owner.clone(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };
        conn.execute(
            "INSERT INTO threads (id, owner, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &thread.id,
                thread.owner.as_str(),
                &thread.title,
                thread.created_at,
                thread.updated_at
            ],
        )?;
        Ok(thread)
    }

    async fn get_thread(&self, thread_id: &ThreadId) -> Result<Option<Thread>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let thread = conn
            .query_row(
                "SELECT id, owner, title, created_at, updated_at FROM threads WHERE id = ?1",
                params![thread_id],
                row_to_thread,
            )
            .optional()?;
        Ok(thread)
    }

    async fn list_threads(
        &self,
        owner: &UserId,
        limit: usize,
    ) -> Result<Vec<ThreadSummary>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT t.id, t.title, t.created_at, t.updated_at,
                    (SELECT COUNT(*) FROM messages WHERE thread_id = t.id) AS msg_count
             FROM threads t
             WHERE t.owner = ?1
             ORDER BY t.created_at DESC, t.rowid DESC
             LIMIT ?2",
        )?;
        let threads = stmt
            .query_map(
                params![owner.as_str(), i64::try_from(limit).unwrap_or(i64::MAX)],
                |row| {
                    let count: i64 = row.get(4)?;
                    Ok(ThreadSummary {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        message_count: count as usize,
                        created_at: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(threads)
    }

    async fn rename_thread(&self, thread_id: &ThreadId, title: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE threads SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, unix_timestamp_ms(), thread_id],
        )?;
        if changed == 0 {
            return Err(StoreError::ThreadNotFound(thread_id.to_string()));
        }
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &ThreadId) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("DELETE FROM threads WHERE id = ?1", params![thread_id])?;
        if changed == 0 {
            return Err(StoreError::ThreadNotFound(thread_id.to_string()));
        }
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
        let conn = self.conn.lock().unwrap();
        let exists: bool = conn
            .prepare("SELECT 1 FROM threads WHERE id = ?1")
            .and_then(|mut stmt| stmt.exists(params![thread_id]))?;
        if !exists {
            return Err(StoreError::ThreadNotFound(thread_id.to_string()));
        }

        // Next sequence number for this thread; the connection mutex makes
        // the read-then-insert pair atomic.
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM messages WHERE thread_id = ?1",
            params![thread_id],
            |row| row.get(0),
        )?;

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
        conn.execute(
            "INSERT INTO messages (id, thread_id, role, sequence_number, content, status, model, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &message.id,
                &message.thread_id,
                message.role.as_str(),
                message.seq,
                &message.content,
                message.status.as_str(),
                message.model.as_deref(),
                message.created_at,
                message.updated_at
            ],
        )?;
        conn.execute(
            "UPDATE threads SET updated_at = ?1 WHERE id = ?2",
            params![now, thread_id],
        )?;
        Ok(message)
    }

    async fn get_message(&self, message_id: &MessageId) -> Result<Option<Message>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let message = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![message_id],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    async fn message_at(
        &self,
        thread_id: &ThreadId,
        seq: i64,
    ) -> Result<Option<Message>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let message = conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE thread_id = ?1 AND sequence_number = ?2"
                ),
                params![thread_id, seq],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    async fn transition_status(
        &self,
        message_id: &MessageId,
        expected: &[MessageStatus],
        next: MessageStatus,
        content: Option<&str>,
    ) -> Result<Message, StoreError> {
        let conn = self.conn.lock().unwrap();

        // The connection mutex serializes the check with the update, so a
        // plain read suffices for the compare half of the swap.
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM messages WHERE id = ?1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()?;
        let actual = status
            .map(|s| MessageStatus::from_str(&s).unwrap_or(MessageStatus::Failed))
            .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;
        if !expected.contains(&actual) {
            return Err(StoreError::Conflict { actual });
        }

        conn.execute(
            "UPDATE messages SET status = ?1, content = COALESCE(?2, content), updated_at = ?3
             WHERE id = ?4",
            params![next.as_str(), content, unix_timestamp_ms(), message_id],
        )?;

        let message = conn.query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![message_id],
            row_to_message,
        )?;
        Ok(message)
    }

    async fn list_messages(
        &self,
        thread_id: &ThreadId,
        after_seq: Option<i64>,
        limit: usize,
        include_superseded: bool,
    ) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let exists: bool = conn
            .prepare("SELECT 1 FROM threads WHERE id = ?1")
            .and_then(|mut stmt| stmt.exists(params![thread_id]))?;
        if !exists {
            return Err(StoreError::ThreadNotFound(thread_id.to_string()));
        }

        let status_filter = if include_superseded {
            ""
        } else {
            "AND status != 'superseded'"
        };
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE thread_id = ?1 AND sequence_number > ?2 {status_filter}
             ORDER BY sequence_number ASC
             LIMIT ?3",
        ))?;
        let messages = stmt
            .query_map(
                params![
                    thread_id,
                    after_seq.unwrap_or(0),
                    i64::try_from(limit).unwrap_or(i64::MAX)
                ],
                row_to_message,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    async fn last_model(&self, thread_id: &ThreadId) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let model = conn
            .query_row(
                "SELECT model FROM messages
                 WHERE thread_id = ?1 AND role = 'assistant' AND model IS NOT NULL
                 ORDER BY sequence_number DESC
                 LIMIT 1",
                params![thread_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(model)
    }

    async fn record_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobs (id, kind, thread_id, message_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &job.id,
                job.kind.as_str(),
                &job.thread_id,
                &job.message_id,
                job.status.as_str(),
                job.created_at,
                job.updated_at
            ],
        )?;
        Ok(())
    }

    async fn update_job_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), unix_timestamp_ms(), job_id],
        )?;
        if changed == 0 {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn job_for_message(
        &self,
        message_id: &MessageId,
        kind: JobKind,
    ) -> Result<Option<JobRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row(
                "SELECT id, kind, thread_id, message_id, status, created_at, updated_at
                 FROM jobs
                 WHERE message_id = ?1 AND kind = ?2
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT 1",
                params![message_id, kind.as_str()],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }
}
