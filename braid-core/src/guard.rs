//! Thread access control
//!
//! Every thread-scoped operation resolves the caller's identity and checks
//! ownership before touching storage. The check order is fixed: a missing
//! identity is rejected before the thread is even looked up; after that, a
//! missing thread is `NotFound` and a thread owned by someone else is
//! `Unauthorized`.

use async_trait::async_trait;

use crate::error::ChatError;
use crate::storage::{Thread, ThreadId, ThreadStore, UserId};

/// Source of the caller's identity.
///
/// Embedders plug in whatever session or token scheme they have; the
/// engine only needs to know who is asking, if anyone.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn caller_identity(&self) -> Option<UserId>;
}

/// A fixed identity, for single-tenant embedding and tests.
pub struct StaticIdentity(pub UserId);

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn caller_identity(&self) -> Option<UserId> {
        Some(self.0.clone())
    }
}

/// An absent identity. Every thread-scoped call through this fails.
pub struct Anonymous;

#[async_trait]
impl IdentityProvider for Anonymous {
    async fn caller_identity(&self) -> Option<UserId> {
        None
    }
}

/// Check that `caller` may operate on `thread_id`, returning the thread.
pub async fn authorize(
    store: &dyn ThreadStore,
    caller: Option<&UserId>,
    thread_id: &ThreadId,
) -> Result<Thread, ChatError> {
    let caller = caller.ok_or(ChatError::Unauthorized)?;
    let thread = store
        .get_thread(thread_id)
        .await?
        .ok_or_else(|| ChatError::NotFound(format!("thread {thread_id}")))?;
    if &thread.owner != caller {
        return Err(ChatError::Unauthorized);
    }
    Ok(thread)
}
