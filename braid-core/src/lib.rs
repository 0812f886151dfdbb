//! Core engine for streaming LLM chat threads
//!
//! This crate provides:
//! - **Engine**: `ChatService` orchestrating threads, messages, and jobs
//! - **Storage**: `ThreadStore` trait with `MemoryStore` and `SqliteStore`
//!   backends
//! - **Streaming**: chunked delta pipeline with throttled flushes and live
//!   fan-out to any number of readers
//! - **Jobs**: background generation, retry with model override, and
//!   automatic thread titling
//!
//! # Example
//!
//! ```ignore
//! use braid_core::{ChatService, EngineConfig, MemoryStore, StaticIdentity, UserId};
//! use llm::{ModelRegistry, OpenAICompatProvider};
//!
//! let models = ModelRegistry::new()
//!     .with_provider("google", Arc::new(OpenAICompatProvider::gemini(&api_key)));
//! let service = ChatService::new(
//!     Arc::new(MemoryStore::new()),
//!     models,
//!     Arc::new(StaticIdentity(UserId::from("me"))),
//!     EngineConfig::default(),
//! );
//! let (thread_id, message_id) = service.create_thread("hello", None).await?;
//! ```
pub mod config;
pub mod engine;
pub mod error;
pub mod guard;
pub mod ledger;
pub mod read;
pub mod retry;
pub mod storage;
pub mod stream;
pub mod title;

pub use config::{ChunkingPolicy, EngineConfig, ModelCatalogEntry};
pub use engine::{ChatService, SharedEventSender, ThreadEvent};
pub use error::ChatError;
pub use guard::{Anonymous, IdentityProvider, StaticIdentity};
pub use ledger::MessageLedger;
pub use read::{MessagePage, MessageQuery, MessageView};
pub use retry::RetryOutcome;
pub use storage::{
    JobId, JobKind, JobRecord, JobStatus, MemoryStore, Message, MessageId, MessageRole,
    MessageStatus, StoreError, Thread, ThreadId, ThreadStore, ThreadSummary, UserId,
};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStore;
pub use stream::{StreamDelta, StreamOutcome, StreamRegistry, StreamSnapshot};
pub use title::{PLACEHOLDER_TITLE, UNTITLED};
