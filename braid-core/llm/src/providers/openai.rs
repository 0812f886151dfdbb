//! Provider for OpenAI-compatible chat-completions endpoints.
//!
//! Several hosted and local backends (OpenAI, Gemini's compatibility layer,
//! Ollama, vLLM) speak the same protocol, so a single provider covers them:
//! blocking completion via JSON POST, streaming via SSE `data:` frames
//! terminated by `[DONE]`.

use crate::api::{ChatChunk, ChatMessage, ChatRequest, Role};
use crate::client::Client;
use crate::{ChatModel, ChatStream, ModelDefinition, ModelProvider};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Clone, Debug, Deserialize, Serialize)]
struct Message {
    role: Role,
    content: String,
}

impl From<&ChatMessage> for Message {
    fn from(msg: &ChatMessage) -> Self {
        Message {
            role: msg.role,
            content: msg.content.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
}

impl ChatCompletionRequest {
    fn from_request(model: String, request: &ChatRequest, stream: bool) -> Self {
        ChatCompletionRequest {
            model,
            messages: request.messages().iter().map(Message::from).collect(),
            stream,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
struct ChatCompletionChoice {
    message: Message,
}

#[derive(Clone, Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

impl From<ChatCompletionResponse> for ChatMessage {
    fn from(response: ChatCompletionResponse) -> Self {
        match response.choices.into_iter().next() {
            Some(choice) => ChatMessage::new(choice.message.role, choice.message.content),
            None => ChatMessage::assistant(""),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
struct ChatCompletionChunkDelta {
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct ChatCompletionChunkChoice {
    delta: ChatCompletionChunkDelta,
}

#[derive(Clone, Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChatCompletionChunkChoice>,
}

#[derive(Clone, Debug, Deserialize)]
struct Model {
    id: String,
}

#[derive(Clone, Debug, Deserialize)]
struct ListModelsResponse {
    data: Vec<Model>,
}

/// Extract the JSON payload from one SSE line. `data: [DONE]` marks
/// end-of-stream and yields nothing.
fn sse_data_line(line: &str) -> Option<&str> {
    let json_str = line.trim().strip_prefix("data: ")?;
    if json_str == "[DONE]" {
        return None;
    }
    Some(json_str)
}

// ============================================================================
// Provider and model
// ============================================================================

#[derive(Clone)]
pub struct OpenAICompatProvider {
    client: Client,
    base_url: String,
}

impl OpenAICompatProvider {
    pub fn openai(api_key: &str) -> Self {
        Self::new("https://api.openai.com/v1", api_key)
    }

    /// Gemini through Google's OpenAI compatibility layer.
    pub fn gemini(api_key: &str) -> Self {
        Self::new(
            "https://generativelanguage.googleapis.com/v1beta/openai",
            api_key,
        )
    }

    /// Create a provider against any compatible endpoint. `base_url`
    /// carries the version path (e.g. `.../v1`); pass an empty key for
    /// servers that do not authenticate.
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if !api_key.is_empty() {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", api_key))
                    .expect("Invalid API key format"),
            );
        }

        OpenAICompatProvider {
            client: Client::with_headers(headers),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }
}

#[async_trait]
impl ModelProvider for OpenAICompatProvider {
    async fn list_models(&self) -> anyhow::Result<Vec<ModelDefinition>> {
        let response: ListModelsResponse = self.client.get(self.models_url()).await?;
        Ok(response
            .data
            .into_iter()
            .map(|m| ModelDefinition::new(m.id))
            .collect())
    }

    fn create_chat_model(&self, model_name: &str) -> Option<Arc<dyn ChatModel + Send + Sync>> {
        Some(Arc::new(OpenAICompatChatModel::new(
            self.client.clone(),
            self.base_url.clone(),
            model_name.to_string(),
        )))
    }
}

#[derive(Clone)]
pub struct OpenAICompatChatModel {
    client: Client,
    base_url: String,
    model_name: String,
}

impl OpenAICompatChatModel {
    pub fn new(client: Client, base_url: String, model_name: String) -> Self {
        OpenAICompatChatModel {
            client,
            base_url,
            model_name,
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ChatModel for OpenAICompatChatModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    async fn chat(&self, request: &ChatRequest) -> anyhow::Result<ChatMessage> {
        let wire_request =
            ChatCompletionRequest::from_request(self.model_name.clone(), request, false);
        let response: ChatCompletionResponse =
            self.client.post(self.chat_url(), &wire_request).await?;
        Ok(response.into())
    }

    async fn stream_chat(&self, request: &ChatRequest) -> anyhow::Result<ChatStream> {
        let wire_request =
            ChatCompletionRequest::from_request(self.model_name.clone(), request, true);

        let stream = self
            .client
            .post_stream::<_, _, _, ChatCompletionChunk>(
                self.chat_url(),
                &wire_request,
                sse_data_line,
            )
            .await?;

        let chat_stream = stream.filter_map(|chunk| {
            let piece = match chunk {
                Ok(chunk) => chunk.choices.into_iter().next().map(|choice| {
                    let role = choice.delta.role.unwrap_or(Role::Assistant);
                    let content = choice.delta.content.unwrap_or_default();
                    Ok(ChatChunk::new(role, content))
                }),
                Err(e) => Some(Err(e)),
            };
            futures::future::ready(piece)
        });

        Ok(Box::pin(chat_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_data_line() {
        assert_eq!(
            sse_data_line("data: {\"choices\":[]}"),
            Some("{\"choices\":[]}")
        );
        assert_eq!(sse_data_line("data: [DONE]"), None);
        assert_eq!(sse_data_line(": keep-alive"), None);
        assert_eq!(sse_data_line(""), None);
        // Leading whitespace from chunked transfer is tolerated
        assert_eq!(sse_data_line("  data: {}"), Some("{}"));
    }

    #[test]
    fn test_request_serialization() {
        let messages = vec![
            ChatMessage::system("Be brief."),
            ChatMessage::user("Hello"),
        ];
        let request = ChatRequest::new(&messages);
        let wire = ChatCompletionRequest::from_request("gpt-test".to_string(), &request, true);

        let json = serde_json::to_string(&wire).unwrap();
        assert!(json.contains("\"model\":\"gpt-test\""));
        assert!(json.contains("\"stream\":true"));
        assert!(json.contains("\"role\":\"system\""));
        assert!(json.contains("\"content\":\"Hello\""));
    }

    #[test]
    fn test_response_into_message() {
        let json = r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"Hi there"},"finish_reason":"stop"}]}"#;
        let response: ChatCompletionResponse = serde_json::from_str(json).unwrap();
        let msg: ChatMessage = response.into();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.content, "Hi there");
    }

    #[test]
    fn test_empty_response_yields_empty_assistant() {
        let response: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        let msg: ChatMessage = response.into();
        assert_eq!(msg.role, Role::Assistant);
        assert!(msg.content.is_empty());
    }

    #[test]
    fn test_chunk_deserialization() {
        let json = r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{"content":"wor"},"finish_reason":null}]}"#;
        let chunk: ChatCompletionChunk = serde_json::from_str(json).unwrap();
        let choice = chunk.choices.into_iter().next().unwrap();
        assert_eq!(choice.delta.content.as_deref(), Some("wor"));
        assert!(choice.delta.role.is_none());
    }

    #[test]
    fn test_provider_url_shapes() {
        let provider = OpenAICompatProvider::new("http://localhost:11434/v1/", "");
        assert_eq!(provider.models_url(), "http://localhost:11434/v1/models");

        let model = provider.create_chat_model("llama3").unwrap();
        assert_eq!(model.name(), "llama3");

        let gemini = OpenAICompatProvider::gemini("k");
        assert_eq!(
            gemini.models_url(),
            "https://generativelanguage.googleapis.com/v1beta/openai/models"
        );
    }
}
