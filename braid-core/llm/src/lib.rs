use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;
use std::sync::Arc;

pub mod api;
mod client;
pub mod providers;
pub use api::*;
pub use providers::{OpenAICompatChatModel, OpenAICompatProvider};

/// Streamed reply: chunks until end-of-stream, or an error that terminates
/// the stream. A transport or backend failure mid-stream surfaces as an
/// `Err` item so callers can distinguish it from a clean end.
pub type ChatStream = Pin<Box<dyn Stream<Item = anyhow::Result<ChatChunk>> + Send>>;

#[derive(Clone, Debug)]
pub struct ModelDefinition {
    pub id: String,
    pub display_name: Option<String>,
}

impl ModelDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: Some(display_name.into()),
        }
    }

    /// Get the display name, falling back to id if not set
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

#[async_trait]
pub trait ChatModel {
    fn name(&self) -> &str;

    async fn chat(&self, messages: &ChatRequest) -> anyhow::Result<ChatMessage>;

    async fn stream_chat(&self, messages: &ChatRequest) -> anyhow::Result<ChatStream>;
}

// Blanket implementation for Arc<dyn ChatModel> to make it easier to work with
#[async_trait]
impl ChatModel for Arc<dyn ChatModel + Send + Sync> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn chat(&self, messages: &ChatRequest) -> anyhow::Result<ChatMessage> {
        (**self).chat(messages).await
    }

    async fn stream_chat(&self, messages: &ChatRequest) -> anyhow::Result<ChatStream> {
        (**self).stream_chat(messages).await
    }
}

#[async_trait]
pub trait ModelProvider {
    /// List available models from the provider
    async fn list_models(&self) -> anyhow::Result<Vec<ModelDefinition>>;

    /// Create a chat model by name, returned as Arc for sharing across threads
    fn create_chat_model(&self, model_name: &str) -> Option<Arc<dyn ChatModel + Send + Sync>>;
}

/// Resolves model identifiers to chat backends.
///
/// Providers are stateless factories; a new model handle is constructed per
/// lookup rather than cached, so there is no process-wide mutable model
/// object. Identifiers may be qualified as `provider/model` to pick a
/// specific provider; bare identifiers are offered to each registered
/// provider in registration order.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    providers: Vec<(String, Arc<dyn ModelProvider + Send + Sync>)>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        provider: Arc<dyn ModelProvider + Send + Sync>,
    ) {
        self.providers.push((name.into(), provider));
    }

    pub fn with_provider(
        mut self,
        name: impl Into<String>,
        provider: Arc<dyn ModelProvider + Send + Sync>,
    ) -> Self {
        self.register(name, provider);
        self
    }

    /// Resolve a model id to a backend, or None if no provider knows it.
    pub fn model(&self, model_id: &str) -> Option<Arc<dyn ChatModel + Send + Sync>> {
        if let Some((provider_name, model_name)) = model_id.split_once('/') {
            return self
                .providers
                .iter()
                .find(|(name, _)| name == provider_name)
                .and_then(|(_, provider)| provider.create_chat_model(model_name));
        }
        self.providers
            .iter()
            .find_map(|(_, provider)| provider.create_chat_model(model_id))
    }

    /// Aggregate model listings across all registered providers.
    ///
    /// A provider that fails to answer is skipped rather than failing the
    /// whole listing.
    pub async fn list_models(&self) -> Vec<ModelDefinition> {
        let mut all = Vec::new();
        for (name, provider) in &self.providers {
            match provider.list_models().await {
                Ok(models) => all.extend(models),
                Err(e) => {
                    tracing::warn!("listing models from provider {} failed: {}", name, e);
                }
            }
        }
        all
    }
}
