//! Engine configuration
//!
//! Everything tunable about streaming, pagination, and model selection lives
//! here. Loaded from TOML (every field optional, falling back to defaults)
//! or built in code.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How buffered model output is cut into visible deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingPolicy {
    /// Flush on word boundaries. Pairs with a short throttle window.
    Word,
    /// Flush on newlines. Pairs with a long throttle window.
    Line,
}

impl ChunkingPolicy {
    /// The throttle window this policy is normally paired with.
    pub fn default_throttle_ms(&self) -> u64 {
        match self {
            ChunkingPolicy::Word => 50,
            ChunkingPolicy::Line => 1000,
        }
    }
}

/// One selectable model as shown to users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCatalogEntry {
    /// Backend model id, e.g. "gemini-2.5-flash"
    pub id: String,
    /// Human-readable name, e.g. "Gemini 2.5 Flash"
    pub name: String,
    pub provider: String,
}

/// Engine settings stored in a TOML config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub chunking: ChunkingPolicy,
    /// Minimum milliseconds between visible delta flushes
    pub throttle_ms: u64,
    /// Overall wall-clock limit for one generation, in seconds
    pub stream_timeout_secs: u64,
    /// A streaming message with no live session counts as orphaned once it
    /// has gone `throttle_ms * stale_multiplier` without an update.
    pub stale_multiplier: u32,
    pub default_model: String,
    /// Model used for the title job; falls back to `default_model`
    pub title_model: Option<String>,
    /// Instructions prepended to every generation request
    pub system_prompt: Option<String>,
    /// How many threads a listing returns
    pub thread_page_size: usize,
    /// Default page size for message listings
    pub message_page_size: usize,
    /// Hard cap a caller-supplied page size is clamped to
    pub max_page_size: usize,
    pub catalog: Vec<ModelCatalogEntry>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingPolicy::Word,
            throttle_ms: ChunkingPolicy::Word.default_throttle_ms(),
            stream_timeout_secs: 120,
            stale_multiplier: 40,
            default_model: "gemini-2.5-flash".to_string(),
            title_model: None,
            system_prompt: None,
            thread_page_size: 20,
            message_page_size: 50,
            max_page_size: 200,
            catalog: default_catalog(),
        }
    }
}

fn default_catalog() -> Vec<ModelCatalogEntry> {
    [
        ("gemini-2.5-flash", "Gemini 2.5 Flash"),
        ("gemini-2.5-flash-lite-preview-06-17", "Gemini 2.5 Flash-Lite"),
        ("gemini-2.5-pro", "Gemini 2.5 Pro"),
    ]
    .into_iter()
    .map(|(id, name)| ModelCatalogEntry {
        id: id.to_string(),
        name: name.to_string(),
        provider: "Google".to_string(),
    })
    .collect()
}

impl EngineConfig {
    /// Parse a TOML config, falling back to defaults for missing fields
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    /// Age past which a streaming message without a live session is
    /// considered orphaned.
    pub fn stale_after(&self) -> Duration {
        self.throttle() * self.stale_multiplier
    }

    pub fn title_model(&self) -> &str {
        self.title_model.as_deref().unwrap_or(&self.default_model)
    }

    /// Clamp a caller-supplied page size to the configured bounds.
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.message_page_size)
            .clamp(1, self.max_page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.chunking, ChunkingPolicy::Word);
        assert_eq!(config.throttle(), Duration::from_millis(50));
        assert_eq!(config.stream_timeout(), Duration::from_secs(120));
        assert_eq!(config.stale_after(), Duration::from_secs(2));
        assert_eq!(config.title_model(), "gemini-2.5-flash");
        assert_eq!(config.catalog.len(), 3);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = EngineConfig::from_toml_str(
            r#"
            chunking = "line"
            throttle_ms = 1000
            default_model = "gemini-2.5-pro"
            "#,
        )
        .unwrap();
        assert_eq!(config.chunking, ChunkingPolicy::Line);
        assert_eq!(config.throttle(), Duration::from_millis(1000));
        assert_eq!(config.default_model, "gemini-2.5-pro");
        // Untouched fields keep their defaults
        assert_eq!(config.message_page_size, 50);
    }

    #[test]
    fn test_from_toml_rejects_bad_policy() {
        assert!(EngineConfig::from_toml_str("chunking = \"sentence\"").is_err());
    }

    #[test]
    fn test_page_size_clamps() {
        let config = EngineConfig::default();
        assert_eq!(config.page_size(None), 50);
        assert_eq!(config.page_size(Some(10)), 10);
        assert_eq!(config.page_size(Some(10_000)), 200);
        assert_eq!(config.page_size(Some(0)), 1);
    }

    #[test]
    fn test_title_model_override() {
        let config = EngineConfig {
            title_model: Some("gemini-2.5-flash-lite-preview-06-17".to_string()),
            ..Default::default()
        };
        assert_eq!(config.title_model(), "gemini-2.5-flash-lite-preview-06-17");
    }
}
