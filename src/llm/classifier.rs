//! Intent classification.
//!
//! Asks the configured backend to sort a user message into one of a fixed
//! set of intents and extract parameters for it. OpenAI-compatible backends
//! are driven through function calling; Ollama is asked for a bare JSON
//! object in constrained-JSON mode. Classification never fails: any error
//! yields the `general_chat` fallback.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::llm::{ChatMessage, LlmBackend, LlmConfig, Role};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const TEMPERATURE: f64 = 0.1;
const FUNCTION_NAME: &str = "classify_intent";

const SYSTEM_PROMPT: &str = "You are the intent classifier of ClawChat, a personal productivity \
assistant. Users manage todos, calendar events and memos in natural language. Classify the \
user's latest message into one of the supported intents and extract the relevant entities. \
Conversational messages and questions unrelated to todos, events or memos are \"general_chat\". \
Only choose a create, update or delete intent when the user clearly asks for it.";

/// What the user wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    GeneralChat,
    CreateTodo,
    QueryTodos,
    UpdateTodo,
    DeleteTodo,
    CompleteTodo,
    CreateEvent,
    QueryEvents,
    UpdateEvent,
    DeleteEvent,
    CreateMemo,
    QueryMemos,
    UpdateMemo,
    DeleteMemo,
    Search,
    DelegateTask,
    DailyBriefing,
}

impl Intent {
    pub const ALL: [Intent; 17] = [
        Self::GeneralChat,
        Self::CreateTodo,
        Self::QueryTodos,
        Self::UpdateTodo,
        Self::DeleteTodo,
        Self::CompleteTodo,
        Self::CreateEvent,
        Self::QueryEvents,
        Self::UpdateEvent,
        Self::DeleteEvent,
        Self::CreateMemo,
        Self::QueryMemos,
        Self::UpdateMemo,
        Self::DeleteMemo,
        Self::Search,
        Self::DelegateTask,
        Self::DailyBriefing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GeneralChat => "general_chat",
            Self::CreateTodo => "create_todo",
            Self::QueryTodos => "query_todos",
            Self::UpdateTodo => "update_todo",
            Self::DeleteTodo => "delete_todo",
            Self::CompleteTodo => "complete_todo",
            Self::CreateEvent => "create_event",
            Self::QueryEvents => "query_events",
            Self::UpdateEvent => "update_event",
            Self::DeleteEvent => "delete_event",
            Self::CreateMemo => "create_memo",
            Self::QueryMemos => "query_memos",
            Self::UpdateMemo => "update_memo",
            Self::DeleteMemo => "delete_memo",
            Self::Search => "search",
            Self::DelegateTask => "delegate_task",
            Self::DailyBriefing => "daily_briefing",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Intent {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|intent| intent.as_str() == s)
            .ok_or_else(|| format!("Unknown intent: {}", s))
    }
}

/// Classifier output. `intent` is always a known intent and `confidence`
/// always lies in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub intent: Intent,
    pub entities: Map<String, Value>,
    pub confidence: f64,
}

impl ClassificationResult {
    /// The result used whenever classification fails.
    pub fn fallback() -> Self {
        Self {
            intent: Intent::GeneralChat,
            entities: Map::new(),
            confidence: 0.0,
        }
    }

    /// Coerce a decoded JSON object into a result. Unknown intents become
    /// `general_chat`, non-object entities become empty, and missing or
    /// non-numeric confidence becomes 0.
    pub fn from_value(value: &Value) -> Self {
        let intent = value
            .get("intent")
            .and_then(Value::as_str)
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(Intent::GeneralChat);
        let entities = match value.get("entities") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        let confidence = value
            .get("confidence")
            .and_then(Value::as_f64)
            .filter(|c| c.is_finite())
            .map(|c| c.clamp(0.0, 1.0))
            .unwrap_or(0.0);
        Self {
            intent,
            entities,
            confidence,
        }
    }
}

/// Parse the raw JSON text produced by the model.
pub(crate) fn parse_classification(raw: &str) -> Result<ClassificationResult, LlmError> {
    let value: Value = serde_json::from_str(raw.trim())?;
    if !value.is_object() {
        return Err(LlmError::InvalidResponse {
            provider: "classifier".to_string(),
            reason: format!("expected a JSON object, got: {}", truncate(raw, 200)),
        });
    }
    Ok(ClassificationResult::from_value(&value))
}

fn truncate(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

/// Anything that can classify a message. Implementations must not fail.
#[async_trait]
pub trait IntentDetector: Send + Sync {
    async fn classify(&self, message: &str, context: &[ChatMessage]) -> ClassificationResult;
}

/// LLM-backed classifier.
pub struct IntentClassifier {
    http: reqwest::Client,
    config: LlmConfig,
    context_window: usize,
}

impl IntentClassifier {
    /// `context_window` caps how many prior user/assistant messages are sent.
    pub fn new(config: LlmConfig, context_window: usize) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| config.unavailable(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            config,
            context_window,
        })
    }

    /// Prior user/assistant turns (most recent `context_window`) followed by the message.
    fn conversation(&self, message: &str, context: &[ChatMessage]) -> Vec<ChatMessage> {
        let prior: Vec<&ChatMessage> = context
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .collect();
        let skip = prior.len().saturating_sub(self.context_window);
        let mut messages: Vec<ChatMessage> = prior.into_iter().skip(skip).cloned().collect();
        messages.push(ChatMessage::user(message));
        messages
    }

    async fn try_classify(
        &self,
        message: &str,
        context: &[ChatMessage],
    ) -> Result<ClassificationResult, LlmError> {
        let conversation = self.conversation(message, context);
        match self.config.backend {
            LlmBackend::OpenAiCompatible => self.classify_function_call(conversation).await,
            LlmBackend::Ollama => self.classify_json(conversation).await,
        }
    }

    async fn classify_function_call(
        &self,
        conversation: Vec<ChatMessage>,
    ) -> Result<ClassificationResult, LlmError> {
        let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
        messages.extend(conversation);

        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "functions": [classify_function()],
            "function_call": {"name": FUNCTION_NAME},
            "temperature": TEMPERATURE,
        });
        let mut req = self
            .http
            .post(format!("{}/v1/chat/completions", self.config.base_url))
            .json(&body);
        if let Some(key) = &self.config.api_key
            && !key.expose_secret().is_empty()
        {
            req = req.bearer_auth(key.expose_secret());
        }

        let data = self.send(req).await?;
        let arguments = data
            .pointer("/choices/0/message/function_call/arguments")
            .and_then(Value::as_str)
            .ok_or_else(|| self.invalid("response has no function_call arguments"))?;
        parse_classification(arguments)
    }

    async fn classify_json(
        &self,
        conversation: Vec<ChatMessage>,
    ) -> Result<ClassificationResult, LlmError> {
        let mut messages = vec![ChatMessage::system(json_prompt())];
        messages.extend(conversation);

        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "stream": false,
            "format": "json",
            "options": {"temperature": TEMPERATURE},
        });
        let req = self
            .http
            .post(format!("{}/api/chat", self.config.base_url))
            .json(&body);

        let data = self.send(req).await?;
        let content = data
            .pointer("/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| self.invalid("response has no message content"))?;
        parse_classification(content)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value, LlmError> {
        let resp = req.send().await.map_err(|e| {
            self.config
                .unavailable(format!("Cannot reach {}: {e}", self.config.base_url))
        })?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| self.config.unavailable(format!("Failed to read response: {e}")))?;
        if !status.is_success() {
            return Err(self
                .config
                .unavailable(format!("returned {status}: {}", truncate(&text, 500))));
        }
        Ok(serde_json::from_str(&text)?)
    }

    fn invalid(&self, reason: &str) -> LlmError {
        LlmError::InvalidResponse {
            provider: self.config.provider.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl IntentDetector for IntentClassifier {
    async fn classify(&self, message: &str, context: &[ChatMessage]) -> ClassificationResult {
        match self.try_classify(message, context).await {
            Ok(result) => {
                debug!(
                    intent = %result.intent,
                    confidence = result.confidence,
                    "Message classified"
                );
                result
            }
            Err(e) => {
                warn!(error = %e, "Intent classification failed, falling back to general_chat");
                ClassificationResult::fallback()
            }
        }
    }
}

fn intent_names() -> Vec<&'static str> {
    Intent::ALL.iter().map(|i| i.as_str()).collect()
}

/// Function schema for the function-calling strategy.
fn classify_function() -> Value {
    json!({
        "name": FUNCTION_NAME,
        "description": "Classify the user's message into exactly one intent and extract structured parameters.",
        "parameters": {
            "type": "object",
            "properties": {
                "intent": {
                    "type": "string",
                    "enum": intent_names(),
                    "description": "The classified intent of the user message.",
                },
                "entities": {
                    "type": "object",
                    "description": "Entities extracted from the message; keys depend on the intent. \
                        create_todo: {title, description?, priority?, due_date?, tags?}. \
                        create_event: {title, description?, start_time?, end_time?, location?}. \
                        create_memo: {title?, content}. \
                        query_*: {query?, status?, priority?, date_range?}. \
                        update_*/delete_*/complete_*: {id?, title?, updates?}. \
                        search: {query, types?}. general_chat: {}.",
                    "additionalProperties": true,
                },
                "confidence": {
                    "type": "number",
                    "description": "Confidence between 0 and 1.",
                },
            },
            "required": ["intent", "entities", "confidence"],
        },
    })
}

/// System prompt for the constrained-JSON strategy.
fn json_prompt() -> String {
    format!(
        "Respond with ONLY a JSON object, no markdown and no explanation, with exactly this shape:\n\
         {{\"intent\": \"<one of: {}>\", \"entities\": {{<extracted entities>}}, \"confidence\": <0-1>}}\n\n\
         Classify the user's latest message.",
        intent_names().join(", ")
    )
}
