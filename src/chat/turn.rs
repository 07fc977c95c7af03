//! One chat turn, from the user's message to the persisted assistant reply.
//!
//! A turn runs in two scopes. [`ChatService::begin`] runs inside the request:
//! it persists the user message and inserts an empty assistant message. From
//! then on the turn belongs to the task started by [`ChatTurn::spawn`], which
//! keeps running when the client goes away. That task classifies and
//! dispatches the message, emits events, and finally writes the delivered
//! reply through a freshly opened session.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cards::ActionCard;
use crate::chat::model::StoredMessage;
use crate::error::{ApiError, DatabaseError};
use crate::llm::{ChatMessage, CompletionProvider, Intent, IntentDetector, Role};
use crate::orchestrator::Orchestrator;
use crate::store::{Database, SessionFactory};

/// Fragment sent when the completion backend cannot be reached.
pub const UPSTREAM_APOLOGY: &str =
    "Sorry, I'm having trouble reaching the AI service right now. Please try again in a moment.";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are ClawChat, a personal productivity assistant. \
     Help the user with their tasks, calendar and notes. Be concise and friendly.";

/// Knobs for a turn.
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub system_prompt: String,
    /// Stored messages included in the completion context.
    pub history_window: u32,
    /// Route through the classifier and orchestrator before streaming.
    pub classify_first: bool,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            history_window: 20,
            classify_first: true,
        }
    }
}

/// Server-to-client events of a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// Identifies the assistant message being streamed.
    Metadata {
        conversation_id: Uuid,
        message_id: Uuid,
    },
    Token(String),
    Done,
}

impl TurnEvent {
    /// `data:` payload of the SSE frame.
    pub fn data(&self) -> String {
        match self {
            Self::Metadata {
                conversation_id,
                message_id,
            } => json!({
                "conversation_id": conversation_id,
                "message_id": message_id,
            })
            .to_string(),
            Self::Token(token) => json!({ "token": token }).to_string(),
            Self::Done => "[DONE]".to_string(),
        }
    }
}

/// Where the reply text comes from.
enum ReplySource {
    /// Handler output, emitted as a single fragment.
    Fixed(String),
    /// Live completion over this context.
    Live(Vec<ChatMessage>),
}

/// Outcome of classification and dispatch.
struct Route {
    intent: Option<Intent>,
    action_card: Option<ActionCard>,
    source: ReplySource,
}

/// Runs chat turns.
pub struct ChatService {
    sessions: Arc<dyn SessionFactory>,
    completion: Arc<dyn CompletionProvider>,
    classifier: Arc<dyn IntentDetector>,
    orchestrator: Arc<Orchestrator>,
    settings: TurnSettings,
}

impl ChatService {
    pub fn new(
        sessions: Arc<dyn SessionFactory>,
        completion: Arc<dyn CompletionProvider>,
        classifier: Arc<dyn IntentDetector>,
        orchestrator: Arc<Orchestrator>,
        settings: TurnSettings,
    ) -> Self {
        Self {
            sessions,
            completion,
            classifier,
            orchestrator,
            settings,
        }
    }

    pub fn sessions(&self) -> &Arc<dyn SessionFactory> {
        &self.sessions
    }

    /// Request-scoped half of a turn. Fails with `NotFound` for an unknown
    /// conversation before anything is written.
    ///
    /// Only local store writes happen here; classification and dispatch run
    /// in the turn task so a client hanging up cannot cut them short.
    pub async fn begin(&self, conversation_id: Uuid, content: &str) -> Result<ChatTurn, ApiError> {
        let session = self.sessions.open().await?;
        if session.get_conversation(conversation_id).await?.is_none() {
            return Err(ApiError::NotFound("Conversation".to_string()));
        }

        session
            .insert_message(&StoredMessage::new(conversation_id, Role::User, content))
            .await?;
        session.touch_conversation(conversation_id).await?;

        let history: Vec<ChatMessage> = session
            .recent_messages(conversation_id, self.settings.history_window)
            .await?
            .iter()
            .map(StoredMessage::to_chat_message)
            .collect();

        // Last await of the request scope. Once this row exists, only the
        // turn task may finalize it.
        let placeholder = StoredMessage::new(conversation_id, Role::Assistant, "");
        session.insert_message(&placeholder).await?;

        Ok(ChatTurn {
            conversation_id,
            message_id: placeholder.id,
            user_text: content.to_string(),
            history,
            session: Some(session),
            sessions: Arc::clone(&self.sessions),
            completion: Arc::clone(&self.completion),
            classifier: Arc::clone(&self.classifier),
            orchestrator: Arc::clone(&self.orchestrator),
            settings: self.settings.clone(),
        })
    }
}

/// A turn whose user message and placeholder reply are persisted.
pub struct ChatTurn {
    conversation_id: Uuid,
    message_id: Uuid,
    user_text: String,
    /// Stored context, ending with the user message.
    history: Vec<ChatMessage>,
    /// The request's session, used for dispatch and then released.
    session: Option<Box<dyn Database>>,
    sessions: Arc<dyn SessionFactory>,
    completion: Arc<dyn CompletionProvider>,
    classifier: Arc<dyn IntentDetector>,
    orchestrator: Arc<Orchestrator>,
    settings: TurnSettings,
}

impl ChatTurn {
    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    /// Id of the assistant message this turn fills in.
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Run the turn on its own task.
    ///
    /// Events arrive on the returned receiver one at a time: the next one is
    /// produced only after the previous one has been taken. Dropping the
    /// receiver stops the reply at the next fragment. The task resolves to
    /// the persisted reply, made of the fragments the receiver took.
    pub fn spawn(self) -> (mpsc::Receiver<TurnEvent>, JoinHandle<String>) {
        let (tx, rx) = mpsc::channel(1);
        (rx, tokio::spawn(self.run(tx)))
    }

    async fn run(mut self, tx: mpsc::Sender<TurnEvent>) -> String {
        let mut delivered = Delivered::default();
        let metadata = TurnEvent::Metadata {
            conversation_id: self.conversation_id,
            message_id: self.message_id,
        };
        if let Some(permit) = delivered.ready(&tx).await {
            permit.send(metadata);
        }

        // Runs even without a listener so a handler's change is recorded
        // together with its intent and card.
        let route = self.route().await;

        match &route.source {
            ReplySource::Fixed(text) => {
                if let Some(permit) = delivered.ready(&tx).await {
                    delivered.send(permit, text.clone());
                }
            }
            ReplySource::Live(messages) => {
                self.stream_completion(messages, &tx, &mut delivered).await;
            }
        }
        match delivered.ready(&tx).await {
            Some(permit) => permit.send(TurnEvent::Done),
            None => info!(message_id = %self.message_id, "Client disconnected before the reply ended"),
        }

        let content = delivered.content;
        self.finalize(&route, &content).await;
        content
    }

    /// Classify and dispatch on the request's session, then release it.
    async fn route(&mut self) -> Route {
        let session = self.session.take();
        let live = |history: &[ChatMessage], prompt: &str| {
            let mut messages = Vec::with_capacity(history.len() + 1);
            messages.push(ChatMessage::system(prompt.to_string()));
            messages.extend_from_slice(history);
            ReplySource::Live(messages)
        };

        let Some(session) = session.filter(|_| self.settings.classify_first) else {
            return Route {
                intent: None,
                action_card: None,
                source: live(&self.history, &self.settings.system_prompt),
            };
        };

        // The newest history entry is the message being classified.
        let context = &self.history[..self.history.len().saturating_sub(1)];
        let classification = self.classifier.classify(&self.user_text, context).await;
        let result = self
            .orchestrator
            .process(
                session.as_ref(),
                classification.intent,
                &classification.entities,
                &self.user_text,
            )
            .await;
        debug!(
            intent = %result.intent,
            confidence = classification.confidence,
            streamed = result.should_stream,
            "Turn routed"
        );

        if result.should_stream {
            Route {
                intent: Some(result.intent),
                action_card: None,
                source: live(&self.history, &self.settings.system_prompt),
            }
        } else {
            Route {
                intent: Some(result.intent),
                action_card: result.action_card,
                source: ReplySource::Fixed(result.response_text),
            }
        }
    }

    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
        tx: &mpsc::Sender<TurnEvent>,
        delivered: &mut Delivered,
    ) {
        if tx.is_closed() {
            return;
        }
        let mut tokens = match self.completion.stream(messages).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(
                    provider = self.completion.provider_name(),
                    error = %e,
                    "Completion unavailable"
                );
                if let Some(permit) = delivered.ready(tx).await {
                    delivered.send(permit, UPSTREAM_APOLOGY.to_string());
                }
                return;
            }
        };

        loop {
            let Some(permit) = delivered.ready(tx).await else {
                info!(message_id = %self.message_id, "Client disconnected mid-stream");
                return;
            };
            match tokens.next().await {
                Some(Ok(token)) => delivered.send(permit, token),
                Some(Err(e)) => {
                    warn!(error = %e, "Completion stream failed");
                    delivered.send(permit, UPSTREAM_APOLOGY.to_string());
                    return;
                }
                None => return,
            }
        }
    }

    /// Final write in its own session. Failures are logged, never surfaced.
    async fn finalize(&self, route: &Route, content: &str) {
        if let Err(e) = self.write_reply(route, content).await {
            error!(
                conversation_id = %self.conversation_id,
                message_id = %self.message_id,
                error = %e,
                "Failed to persist assistant reply"
            );
        }
    }

    async fn write_reply(&self, route: &Route, content: &str) -> Result<(), DatabaseError> {
        let metadata: Option<Value> = route
            .action_card
            .as_ref()
            .map(|card| json!({ "action_card": card.to_value() }));
        let session = self.sessions.open().await?;
        session
            .finalize_message(
                self.message_id,
                content,
                route.intent.map(Intent::as_str),
                metadata.as_ref(),
            )
            .await?;
        session.touch_conversation(self.conversation_id).await?;
        debug!(message_id = %self.message_id, chars = content.len(), "Assistant reply persisted");
        Ok(())
    }
}

/// Reply text the receiver has taken.
///
/// A fragment is counted once the next slot in the channel opens up, which
/// happens only after the receiver has taken it.
#[derive(Default)]
struct Delivered {
    content: String,
    in_flight: Option<String>,
}

impl Delivered {
    /// Wait for room for the next event. `None` once the receiver is gone;
    /// a fragment still in flight at that point is discarded.
    async fn ready<'a>(&mut self, tx: &'a mpsc::Sender<TurnEvent>) -> Option<mpsc::Permit<'a, TurnEvent>> {
        match tx.reserve().await {
            Ok(permit) => {
                if let Some(fragment) = self.in_flight.take() {
                    self.content.push_str(&fragment);
                }
                Some(permit)
            }
            Err(_) => {
                self.in_flight = None;
                None
            }
        }
    }

    fn send(&mut self, permit: mpsc::Permit<'_, TurnEvent>, fragment: String) {
        permit.send(TurnEvent::Token(fragment.clone()));
        self.in_flight = Some(fragment);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::stream;
    use serde_json::Map;

    use crate::error::LlmError;
    use crate::llm::{ClassificationResult, TokenStream};

    use super::*;

    /// Classifier returning a fixed result and counting calls.
    pub struct FixedDetector {
        pub result: ClassificationResult,
        pub calls: AtomicUsize,
        pub contexts: Mutex<Vec<Vec<ChatMessage>>>,
        delay: Option<Duration>,
    }

    impl FixedDetector {
        pub fn new(intent: Intent, entities: Value) -> Self {
            Self {
                result: ClassificationResult {
                    intent,
                    entities: entities.as_object().cloned().unwrap_or_else(Map::new),
                    confidence: 0.9,
                },
                calls: AtomicUsize::new(0),
                contexts: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        pub fn chat() -> Self {
            Self::new(Intent::GeneralChat, json!({}))
        }

        /// Answer only after `delay`, like a slow backend.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }
    }

    #[async_trait]
    impl IntentDetector for FixedDetector {
        async fn classify(&self, _message: &str, context: &[ChatMessage]) -> ClassificationResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.contexts.lock().unwrap().push(context.to_vec());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.result.clone()
        }
    }

    /// Completion stub: fixed tokens, optionally failing after the last one.
    pub struct ScriptedCompletion {
        tokens: Vec<String>,
        fail_connect: bool,
        fail_after: bool,
        pub seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedCompletion {
        pub fn tokens(tokens: &[&str]) -> Self {
            Self {
                tokens: tokens.iter().map(|t| t.to_string()).collect(),
                fail_connect: false,
                fail_after: false,
                seen: Mutex::new(Vec::new()),
            }
        }

        pub fn unavailable() -> Self {
            Self {
                fail_connect: true,
                ..Self::tokens(&[])
            }
        }

        pub fn failing_after(tokens: &[&str]) -> Self {
            Self {
                fail_after: true,
                ..Self::tokens(tokens)
            }
        }
    }

    fn unavailable(reason: &str) -> LlmError {
        LlmError::Unavailable {
            provider: "stub".into(),
            reason: reason.into(),
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedCompletion {
        fn provider_name(&self) -> &str {
            "stub"
        }

        async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream, LlmError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            if self.fail_connect {
                return Err(unavailable("returned 503 Service Unavailable"));
            }

            let mut items: Vec<Result<String, LlmError>> =
                self.tokens.iter().cloned().map(Ok).collect();
            if self.fail_after {
                items.push(Err(unavailable("stream interrupted")));
            }
            Ok(Box::pin(stream::iter(items)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::test_support::{FixedDetector, ScriptedCompletion};
    use super::*;
    use crate::chat::model::Conversation;
    use crate::store::LibSqlBackend;

    struct Harness {
        sessions: Arc<LibSqlBackend>,
        conversation: Uuid,
    }

    impl Harness {
        async fn new() -> Self {
            let sessions = Arc::new(LibSqlBackend::new_memory().await.unwrap());
            let conversation = Conversation::new("Test");
            sessions
                .open()
                .await
                .unwrap()
                .create_conversation(&conversation)
                .await
                .unwrap();
            Self {
                sessions,
                conversation: conversation.id,
            }
        }

        fn service(
            &self,
            completion: Arc<ScriptedCompletion>,
            detector: Arc<FixedDetector>,
            settings: TurnSettings,
        ) -> ChatService {
            ChatService::new(
                self.sessions.clone(),
                completion,
                detector,
                Arc::new(Orchestrator::new()),
                settings,
            )
        }

        async fn store(&self) -> Box<dyn Database> {
            self.sessions.open().await.unwrap()
        }

        async fn assistant_replies(&self) -> Vec<StoredMessage> {
            let (messages, _) = self
                .store()
                .await
                .list_messages(self.conversation, 1, 50)
                .await
                .unwrap();
            messages
                .into_iter()
                .filter(|m| m.role == Role::Assistant)
                .collect()
        }
    }

    /// Session factory that counts opens and fails every open past `healthy`.
    struct CountingSessions {
        inner: Arc<LibSqlBackend>,
        opens: AtomicUsize,
        healthy: usize,
    }

    #[async_trait]
    impl SessionFactory for CountingSessions {
        async fn open(&self) -> Result<Box<dyn Database>, DatabaseError> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.healthy {
                return Err(DatabaseError::Pool("connection limit reached".into()));
            }
            self.inner.open().await
        }
    }

    async fn run(turn: ChatTurn) -> (Vec<TurnEvent>, String) {
        let (mut rx, handle) = turn.spawn();
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (events, handle.await.unwrap())
    }

    async fn joined(handle: JoinHandle<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn event_payloads() {
        let id = Uuid::nil();
        let meta = TurnEvent::Metadata {
            conversation_id: id,
            message_id: id,
        };
        let parsed: Value = serde_json::from_str(&meta.data()).unwrap();
        assert_eq!(parsed["conversation_id"], id.to_string());
        assert_eq!(parsed["message_id"], id.to_string());
        assert_eq!(TurnEvent::Token("a\"b".into()).data(), r#"{"token":"a\"b"}"#);
        assert_eq!(TurnEvent::Done.data(), "[DONE]");
    }

    #[tokio::test]
    async fn streamed_reply_is_persisted_verbatim() {
        let h = Harness::new().await;
        let service = h.service(
            Arc::new(ScriptedCompletion::tokens(&["Hel", "lo", " there"])),
            Arc::new(FixedDetector::chat()),
            TurnSettings::default(),
        );

        let turn = service.begin(h.conversation, "hi").await.unwrap();
        let message_id = turn.message_id();
        let (events, content) = run(turn).await;

        assert_eq!(
            events,
            vec![
                TurnEvent::Metadata {
                    conversation_id: h.conversation,
                    message_id
                },
                TurnEvent::Token("Hel".into()),
                TurnEvent::Token("lo".into()),
                TurnEvent::Token(" there".into()),
                TurnEvent::Done,
            ]
        );
        assert_eq!(content, "Hello there");

        let stored = h.store().await.get_message(message_id).await.unwrap().unwrap();
        assert_eq!(stored.content, "Hello there");
        assert_eq!(stored.role, Role::Assistant);
        assert_eq!(stored.intent.as_deref(), Some("general_chat"));
        assert!(stored.metadata.is_none());
    }

    #[tokio::test]
    async fn unavailable_backend_yields_single_apology() {
        let h = Harness::new().await;
        let service = h.service(
            Arc::new(ScriptedCompletion::unavailable()),
            Arc::new(FixedDetector::chat()),
            TurnSettings::default(),
        );

        let turn = service.begin(h.conversation, "hello?").await.unwrap();
        let message_id = turn.message_id();
        let (events, _) = run(turn).await;

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], TurnEvent::Metadata { .. }));
        assert_eq!(events[1], TurnEvent::Token(UPSTREAM_APOLOGY.into()));
        assert_eq!(events[2], TurnEvent::Done);

        let stored = h.store().await.get_message(message_id).await.unwrap().unwrap();
        assert_eq!(stored.content, UPSTREAM_APOLOGY);
    }

    #[tokio::test]
    async fn mid_stream_failure_appends_apology() {
        let h = Harness::new().await;
        let service = h.service(
            Arc::new(ScriptedCompletion::failing_after(&["Partial"])),
            Arc::new(FixedDetector::chat()),
            TurnSettings::default(),
        );

        let turn = service.begin(h.conversation, "tell me").await.unwrap();
        let (events, content) = run(turn).await;
        assert_eq!(content, format!("Partial{UPSTREAM_APOLOGY}"));
        assert_eq!(events.last(), Some(&TurnEvent::Done));
    }

    #[tokio::test]
    async fn disconnect_persists_only_taken_fragments() {
        let h = Harness::new().await;
        let service = h.service(
            Arc::new(ScriptedCompletion::tokens(&["a", "b", "c", "d", "e"])),
            Arc::new(FixedDetector::chat()),
            TurnSettings::default(),
        );

        let turn = service.begin(h.conversation, "spell it").await.unwrap();
        let message_id = turn.message_id();
        let (mut rx, handle) = turn.spawn();

        assert!(matches!(rx.recv().await, Some(TurnEvent::Metadata { .. })));
        assert_eq!(rx.recv().await, Some(TurnEvent::Token("a".into())));
        // Let the turn queue "b", then hang up without taking it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(rx);

        assert_eq!(joined(handle).await, "a");
        let stored = h.store().await.get_message(message_id).await.unwrap().unwrap();
        assert_eq!(stored.content, "a");
        assert_eq!(h.assistant_replies().await.len(), 1);
    }

    #[tokio::test]
    async fn slow_dispatch_completes_after_client_leaves() {
        let h = Harness::new().await;
        let completion = Arc::new(ScriptedCompletion::tokens(&["unused"]));
        let service = h.service(
            completion.clone(),
            Arc::new(
                FixedDetector::new(Intent::CreateTodo, json!({"title": "buy milk"}))
                    .with_delay(Duration::from_millis(100)),
            ),
            TurnSettings::default(),
        );

        let turn = service.begin(h.conversation, "remind me to buy milk").await.unwrap();
        let message_id = turn.message_id();
        let (rx, handle) = turn.spawn();
        drop(rx);

        assert_eq!(joined(handle).await, "");
        assert!(completion.seen.lock().unwrap().is_empty());

        let store = h.store().await;
        let stored = store.get_message(message_id).await.unwrap().unwrap();
        assert_eq!(stored.content, "");
        assert_eq!(stored.intent.as_deref(), Some("create_todo"));
        let metadata = stored.metadata.unwrap();
        assert_eq!(metadata["action_card"]["card_type"], "todo_created");

        let (todos, total) = store
            .list_todos(&Default::default(), 1, 10)
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(todos[0].title, "buy milk");
    }

    #[tokio::test]
    async fn live_reply_is_skipped_when_client_left_during_classification() {
        let h = Harness::new().await;
        let completion = Arc::new(ScriptedCompletion::tokens(&["hello"]));
        let service = h.service(
            completion.clone(),
            Arc::new(FixedDetector::chat().with_delay(Duration::from_millis(50))),
            TurnSettings::default(),
        );

        let turn = service.begin(h.conversation, "hi").await.unwrap();
        let message_id = turn.message_id();
        let (rx, handle) = turn.spawn();
        drop(rx);

        assert_eq!(joined(handle).await, "");
        assert!(completion.seen.lock().unwrap().is_empty());
        let stored = h.store().await.get_message(message_id).await.unwrap().unwrap();
        assert_eq!(stored.intent.as_deref(), Some("general_chat"));
    }

    #[tokio::test]
    async fn handled_intent_replies_without_completion() {
        let h = Harness::new().await;
        let completion = Arc::new(ScriptedCompletion::tokens(&["should not appear"]));
        let service = h.service(
            completion.clone(),
            Arc::new(FixedDetector::new(
                Intent::CreateTodo,
                json!({"title": "buy milk"}),
            )),
            TurnSettings::default(),
        );

        let turn = service.begin(h.conversation, "remind me to buy milk").await.unwrap();
        let message_id = turn.message_id();
        let (events, content) = run(turn).await;

        assert_eq!(events.len(), 3);
        assert_eq!(content, "I've created a new task: \"buy milk\".");
        assert!(completion.seen.lock().unwrap().is_empty());

        let stored = h.store().await.get_message(message_id).await.unwrap().unwrap();
        assert_eq!(stored.content, content);
        assert_eq!(stored.intent.as_deref(), Some("create_todo"));
        let metadata = stored.metadata.unwrap();
        let card = &metadata["action_card"];
        assert_eq!(card["card_type"], "todo_created");
        assert!(card["payload"]["id"].is_string());
    }

    #[tokio::test]
    async fn completion_context_is_system_prompt_then_history() {
        let h = Harness::new().await;
        let completion = Arc::new(ScriptedCompletion::tokens(&["ok"]));
        let detector = Arc::new(FixedDetector::chat());
        let settings = TurnSettings {
            history_window: 3,
            ..Default::default()
        };
        let service = h.service(completion.clone(), detector.clone(), settings);

        for text in ["first", "second", "third"] {
            let turn = service.begin(h.conversation, text).await.unwrap();
            run(turn).await;
        }

        let seen = completion.seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last[0].role, Role::System);
        assert_eq!(last[0].content, DEFAULT_SYSTEM_PROMPT);
        let rest: Vec<(Role, &str)> = last[1..]
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(
            rest,
            vec![
                (Role::User, "second"),
                (Role::Assistant, "ok"),
                (Role::User, "third"),
            ]
        );

        // Classifier context excludes the message being classified.
        let contexts = detector.contexts.lock().unwrap();
        let last_context = contexts.last().unwrap();
        assert_eq!(last_context.last().map(|m| m.content.as_str()), Some("ok"));
    }

    #[tokio::test]
    async fn unfinished_replies_stay_out_of_the_context() {
        let h = Harness::new().await;
        let store = h.store().await;
        store
            .insert_message(&StoredMessage::new(h.conversation, Role::User, "earlier"))
            .await
            .unwrap();
        store
            .insert_message(&StoredMessage::new(h.conversation, Role::Assistant, ""))
            .await
            .unwrap();

        let completion = Arc::new(ScriptedCompletion::tokens(&["ok"]));
        let service = h.service(
            completion.clone(),
            Arc::new(FixedDetector::chat()),
            TurnSettings::default(),
        );
        let turn = service.begin(h.conversation, "again").await.unwrap();
        run(turn).await;

        let seen = completion.seen.lock().unwrap();
        let contents: Vec<&str> = seen[0][1..].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["earlier", "again"]);
    }

    #[tokio::test]
    async fn final_write_uses_a_second_session() {
        let h = Harness::new().await;
        let sessions = Arc::new(CountingSessions {
            inner: h.sessions.clone(),
            opens: AtomicUsize::new(0),
            healthy: usize::MAX,
        });
        let service = ChatService::new(
            sessions.clone(),
            Arc::new(ScriptedCompletion::tokens(&["Hi"])),
            Arc::new(FixedDetector::chat()),
            Arc::new(Orchestrator::new()),
            TurnSettings::default(),
        );

        let turn = service.begin(h.conversation, "hello").await.unwrap();
        assert_eq!(sessions.opens.load(Ordering::SeqCst), 1);
        let (_, content) = run(turn).await;
        assert_eq!(content, "Hi");
        assert_eq!(sessions.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn final_write_failure_is_swallowed() {
        let h = Harness::new().await;
        let sessions = Arc::new(CountingSessions {
            inner: h.sessions.clone(),
            opens: AtomicUsize::new(0),
            healthy: 1,
        });
        let service = ChatService::new(
            sessions.clone(),
            Arc::new(ScriptedCompletion::tokens(&["Hi", "!"])),
            Arc::new(FixedDetector::chat()),
            Arc::new(Orchestrator::new()),
            TurnSettings::default(),
        );

        let turn = service.begin(h.conversation, "hello").await.unwrap();
        let message_id = turn.message_id();
        let (events, content) = run(turn).await;

        assert_eq!(events.last(), Some(&TurnEvent::Done));
        assert_eq!(content, "Hi!");
        assert_eq!(sessions.opens.load(Ordering::SeqCst), 2);
        let stored = h.store().await.get_message(message_id).await.unwrap().unwrap();
        assert_eq!(stored.content, "");
    }

    #[tokio::test]
    async fn direct_mode_skips_classifier() {
        let h = Harness::new().await;
        let detector = Arc::new(FixedDetector::new(Intent::CreateTodo, json!({"title": "x"})));
        let service = h.service(
            Arc::new(ScriptedCompletion::tokens(&["hi"])),
            detector.clone(),
            TurnSettings {
                classify_first: false,
                ..Default::default()
            },
        );

        let turn = service.begin(h.conversation, "hello").await.unwrap();
        let message_id = turn.message_id();
        let (_, content) = run(turn).await;

        assert_eq!(content, "hi");
        assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
        let stored = h.store().await.get_message(message_id).await.unwrap().unwrap();
        assert!(stored.intent.is_none());
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found_and_writes_nothing() {
        let h = Harness::new().await;
        let service = h.service(
            Arc::new(ScriptedCompletion::tokens(&["hi"])),
            Arc::new(FixedDetector::chat()),
            TurnSettings::default(),
        );
        let missing = Uuid::new_v4();
        let err = service.begin(missing, "hello").await.err().unwrap();
        assert!(matches!(err, ApiError::NotFound(_)));
        let (_, total) = h.store().await.list_messages(missing, 1, 10).await.unwrap();
        assert_eq!(total, 0);
    }
}
