//! Storage abstractions for thread persistence
//!
//! This module provides the trait and implementations for storing threads,
//! messages, and job records. Two implementations are available:
//!
//! - `MemoryStore` - In-memory storage (default, no persistence)
//! - `SqliteStore` - SQLite-backed storage (requires `sqlite` feature)
//!
//! Both implement the same `ThreadStore` trait, making them interchangeable.

pub mod ids;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;
mod traits;
mod types;

pub use ids::{JobId, MessageId, ThreadId, UserId};
pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
pub use traits::ThreadStore;
pub use types::{
    JobKind, JobRecord, JobStatus, Message, MessageRole, MessageStatus, StoreError, Thread,
    ThreadSummary,
};

/// Current unix timestamp in milliseconds
pub(crate) fn unix_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}
