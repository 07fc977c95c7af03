//! Intent orchestrator.
//!
//! Maps a classified intent to a handler that performs the store operation and
//! writes a short reply, optionally with an action card. Intents without a
//! handler fall through to a streamed completion.

pub mod briefing;
pub mod entities;
pub mod events;
pub mod memos;
pub mod search;
pub mod todos;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cards::ActionCard;
use crate::error::DatabaseError;
use crate::llm::Intent;
use crate::store::Database;

pub use entities::Entities;

/// Reply shown when a handler fails for any reason.
pub const HANDLER_APOLOGY: &str =
    "I encountered an error while trying to handle your request. Please try again.";

/// What the session glue needs to finish a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorResult {
    pub intent: Intent,
    pub response_text: String,
    pub action_card: Option<ActionCard>,
    /// True when the reply should come from a live completion instead.
    pub should_stream: bool,
}

impl OrchestratorResult {
    fn streamed(intent: Intent) -> Self {
        Self {
            intent,
            response_text: String::new(),
            action_card: None,
            should_stream: true,
        }
    }

    fn replied(intent: Intent, reply: Reply) -> Self {
        Self {
            intent,
            response_text: reply.text,
            action_card: reply.card,
            should_stream: false,
        }
    }
}

/// A handler's answer: reply text and an optional card.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    pub card: Option<ActionCard>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            card: None,
        }
    }

    pub fn with_card(mut self, card: ActionCard) -> Self {
        self.card = Some(card);
        self
    }
}

/// Handles one intent against the store.
#[async_trait]
pub trait IntentHandler: Send + Sync {
    async fn handle(
        &self,
        store: &dyn Database,
        entities: &Entities,
        user_text: &str,
    ) -> Result<Reply, DatabaseError>;
}

/// Immutable intent dispatch table.
pub struct Orchestrator {
    handlers: HashMap<Intent, Arc<dyn IntentHandler>>,
}

impl Orchestrator {
    pub fn new() -> Self {
        let mut handlers: HashMap<Intent, Arc<dyn IntentHandler>> = HashMap::new();
        handlers.insert(Intent::CreateTodo, Arc::new(todos::CreateTodo));
        handlers.insert(Intent::QueryTodos, Arc::new(todos::QueryTodos));
        handlers.insert(Intent::UpdateTodo, Arc::new(todos::UpdateTodo));
        handlers.insert(Intent::DeleteTodo, Arc::new(todos::DeleteTodo));
        handlers.insert(Intent::CompleteTodo, Arc::new(todos::CompleteTodo));
        handlers.insert(Intent::CreateEvent, Arc::new(events::CreateEvent));
        handlers.insert(Intent::QueryEvents, Arc::new(events::QueryEvents));
        handlers.insert(Intent::UpdateEvent, Arc::new(events::UpdateEvent));
        handlers.insert(Intent::DeleteEvent, Arc::new(events::DeleteEvent));
        handlers.insert(Intent::CreateMemo, Arc::new(memos::CreateMemo));
        handlers.insert(Intent::QueryMemos, Arc::new(memos::QueryMemos));
        handlers.insert(Intent::UpdateMemo, Arc::new(memos::UpdateMemo));
        handlers.insert(Intent::DeleteMemo, Arc::new(memos::DeleteMemo));
        handlers.insert(Intent::Search, Arc::new(search::Search));
        handlers.insert(Intent::DailyBriefing, Arc::new(briefing::DailyBriefing));
        tracing::debug!(handlers = handlers.len(), "Orchestrator ready");
        Self { handlers }
    }

    /// Whether `intent` is answered by a handler rather than a completion.
    pub fn handles(&self, intent: Intent) -> bool {
        self.handlers.contains_key(&intent)
    }

    /// Dispatch `intent`. Never fails: handler errors become an apology.
    pub async fn process(
        &self,
        store: &dyn Database,
        intent: Intent,
        entities: &Entities,
        user_text: &str,
    ) -> OrchestratorResult {
        let Some(handler) = self.handlers.get(&intent) else {
            return OrchestratorResult::streamed(intent);
        };
        match handler.handle(store, entities, user_text).await {
            Ok(reply) => OrchestratorResult::replied(intent, reply),
            Err(e) => {
                tracing::error!(intent = %intent, error = %e, "Intent handler failed");
                OrchestratorResult::replied(intent, Reply::text(HANDLER_APOLOGY))
            }
        }
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{entities, store};
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn chat_intents_fall_through_to_streaming() {
        let orchestrator = Orchestrator::new();
        let store = store().await;
        for intent in [Intent::GeneralChat, Intent::DelegateTask] {
            assert!(!orchestrator.handles(intent));
            let result = orchestrator
                .process(store.as_ref(), intent, &Entities::new(), "hi")
                .await;
            assert!(result.should_stream);
            assert_eq!(result.intent, intent);
            assert!(result.response_text.is_empty());
        }
    }

    #[tokio::test]
    async fn every_store_intent_has_a_handler() {
        let orchestrator = Orchestrator::new();
        let handled = Intent::ALL.iter().filter(|i| orchestrator.handles(**i)).count();
        assert_eq!(handled, Intent::ALL.len() - 2);
    }

    #[tokio::test]
    async fn missing_record_becomes_apology_with_intent_kept() {
        let orchestrator = Orchestrator::new();
        let store = store().await;
        let result = orchestrator
            .process(
                store.as_ref(),
                Intent::DeleteMemo,
                &entities(json!({"id": Uuid::new_v4().to_string()})),
                "delete that memo",
            )
            .await;
        assert_eq!(result.intent, Intent::DeleteMemo);
        assert_eq!(result.response_text, HANDLER_APOLOGY);
        assert!(!result.should_stream);
        assert!(result.action_card.is_none());
    }

    #[tokio::test]
    async fn invalid_id_becomes_apology() {
        let orchestrator = Orchestrator::new();
        let store = store().await;
        let result = orchestrator
            .process(
                store.as_ref(),
                Intent::CompleteTodo,
                &entities(json!({"id": "the milk one"})),
                "done with milk",
            )
            .await;
        assert_eq!(result.response_text, HANDLER_APOLOGY);
        assert_eq!(result.intent, Intent::CompleteTodo);
    }
}
