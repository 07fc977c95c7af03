//! LLM integration for ClawChat.
//!
//! Two wire protocols are supported, selected by the configured provider name:
//! - **Ollama** (`ollama`): native `/api/chat`, newline-delimited JSON.
//! - **OpenAI-compatible** (anything else): `/v1/chat/completions`, server-sent events.
//!
//! [`CompletionClient`] streams reply tokens; [`IntentClassifier`] reuses the
//! same backend for one-shot structured classification.

pub mod classifier;
pub mod completion;

pub use classifier::{ClassificationResult, Intent, IntentClassifier, IntentDetector};
pub use completion::CompletionClient;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

/// A prompt message as sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Supported wire protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Ollama,
    OpenAiCompatible,
}

impl LlmBackend {
    /// `ollama` (any case) selects the native protocol; every other name is
    /// treated as OpenAI-compatible.
    pub fn from_provider(provider: &str) -> Self {
        if provider.trim().eq_ignore_ascii_case("ollama") {
            Self::Ollama
        } else {
            Self::OpenAiCompatible
        }
    }
}

/// Configuration for talking to an LLM backend.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Provider name as configured, used in logs and errors.
    pub provider: String,
    pub backend: LlmBackend,
    /// Base URL without trailing slash.
    pub base_url: String,
    /// Sent as a bearer token to OpenAI-compatible backends when set.
    pub api_key: Option<SecretString>,
    pub model: String,
}

impl LlmConfig {
    pub fn new(provider: &str, base_url: &str, model: impl Into<String>) -> Self {
        Self {
            provider: provider.trim().to_ascii_lowercase(),
            backend: LlmBackend::from_provider(provider),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            model: model.into(),
        }
    }

    pub fn with_api_key(mut self, key: SecretString) -> Self {
        self.api_key = Some(key);
        self
    }

    /// Build an `Unavailable` error tagged with this provider.
    pub(crate) fn unavailable(&self, reason: impl Into<String>) -> LlmError {
        LlmError::Unavailable {
            provider: self.provider.clone(),
            reason: reason.into(),
        }
    }
}

/// Lazy, finite sequence of reply fragments. Ends after the first `Err`.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// Streaming text completion.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name for logs.
    fn provider_name(&self) -> &str;

    /// Open a token stream for `messages`. Connection failures and
    /// non-success statuses are reported here; read failures mid-stream
    /// arrive as an `Err` item.
    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream, LlmError>;
}
