//! Unified `Database` trait: single async interface for all persistence,
//! and the `SessionFactory` that hands out independent sessions.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::calendar::model::{EventFilter, EventItem, EventUpdate};
use crate::chat::model::{Conversation, ConversationSummary, StoredMessage};
use crate::error::DatabaseError;
use crate::memos::model::{Memo, MemoUpdate};
use crate::todos::model::{TodoFilter, TodoItem, TodoUpdate};

/// Record kinds covered by search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchKind {
    Todos,
    Events,
    Memos,
    Messages,
}

impl SearchKind {
    pub const ALL: [SearchKind; 4] = [Self::Todos, Self::Events, Self::Memos, Self::Messages];

    /// Singular label used on hits (`todo`, `event`, ...).
    pub fn label(self) -> &'static str {
        match self {
            Self::Todos => "todo",
            Self::Events => "event",
            Self::Memos => "memo",
            Self::Messages => "message",
        }
    }
}

impl FromStr for SearchKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "todos" | "todo" => Ok(Self::Todos),
            "events" | "event" => Ok(Self::Events),
            "memos" | "memo" => Ok(Self::Memos),
            "messages" | "message" => Ok(Self::Messages),
            other => Err(format!("Unknown search kind: {}", other)),
        }
    }
}

/// A ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: Uuid,
    pub title: String,
    pub snippet: String,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

/// Backend-agnostic store covering conversations, messages, todos, events,
/// memos and cross-kind search.
///
/// Paginated listings take a 1-based `page` and return `(items, total)`.
#[async_trait]
pub trait Database: Send + Sync {
    // ── Conversations ───────────────────────────────────────────────

    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), DatabaseError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError>;

    /// Newest first, filtered by archive flag.
    async fn list_conversations(
        &self,
        archived: bool,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<ConversationSummary>, u64), DatabaseError>;

    /// Mark a conversation archived. `NotFound` if it does not exist.
    async fn archive_conversation(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Bump `updated_at` to now.
    async fn touch_conversation(&self, id: Uuid) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &StoredMessage) -> Result<(), DatabaseError>;

    async fn get_message(&self, id: Uuid) -> Result<Option<StoredMessage>, DatabaseError>;

    /// Write the final content of a message. `NotFound` if it does not exist.
    async fn finalize_message(
        &self,
        id: Uuid,
        content: &str,
        intent: Option<&str>,
        metadata: Option<&Value>,
    ) -> Result<(), DatabaseError>;

    /// Replace a message's content and bump its conversation. `NotFound` if
    /// the message is not part of the conversation.
    async fn update_message_content(
        &self,
        conversation_id: Uuid,
        id: Uuid,
        content: &str,
    ) -> Result<StoredMessage, DatabaseError>;

    /// `NotFound` if the message is not part of the conversation.
    async fn delete_message(&self, conversation_id: Uuid, id: Uuid) -> Result<(), DatabaseError>;

    /// The most recent `limit` user and assistant messages of a conversation,
    /// oldest first. Assistant messages that were never filled in are skipped.
    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, DatabaseError>;

    /// Newest first.
    async fn list_messages(
        &self,
        conversation_id: Uuid,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<StoredMessage>, u64), DatabaseError>;

    // ── Todos ───────────────────────────────────────────────────────

    /// Newest first.
    async fn list_todos(
        &self,
        filter: &TodoFilter,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<TodoItem>, u64), DatabaseError>;

    async fn get_todo(&self, id: Uuid) -> Result<Option<TodoItem>, DatabaseError>;

    async fn create_todo(&self, todo: &TodoItem) -> Result<(), DatabaseError>;

    async fn update_todo(&self, id: Uuid, update: TodoUpdate) -> Result<TodoItem, DatabaseError>;

    async fn delete_todo(&self, id: Uuid) -> Result<(), DatabaseError>;

    // ── Events ──────────────────────────────────────────────────────

    /// Ascending by start time.
    async fn list_events(
        &self,
        filter: &EventFilter,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<EventItem>, u64), DatabaseError>;

    async fn get_event(&self, id: Uuid) -> Result<Option<EventItem>, DatabaseError>;

    async fn create_event(&self, event: &EventItem) -> Result<(), DatabaseError>;

    async fn update_event(&self, id: Uuid, update: EventUpdate)
    -> Result<EventItem, DatabaseError>;

    async fn delete_event(&self, id: Uuid) -> Result<(), DatabaseError>;

    // ── Memos ───────────────────────────────────────────────────────

    /// Most recently updated first.
    async fn list_memos(&self, page: u32, limit: u32) -> Result<(Vec<Memo>, u64), DatabaseError>;

    async fn get_memo(&self, id: Uuid) -> Result<Option<Memo>, DatabaseError>;

    async fn create_memo(&self, memo: &Memo) -> Result<(), DatabaseError>;

    async fn update_memo(&self, id: Uuid, update: MemoUpdate) -> Result<Memo, DatabaseError>;

    async fn delete_memo(&self, id: Uuid) -> Result<(), DatabaseError>;

    // ── Search ──────────────────────────────────────────────────────

    /// Case-insensitive substring search, ranked by score descending.
    async fn search(
        &self,
        query: &str,
        kinds: &[SearchKind],
        page: u32,
        limit: u32,
    ) -> Result<(Vec<SearchHit>, u64), DatabaseError>;
}

/// Hands out independent store sessions.
///
/// Each call to `open()` yields a session with its own lifetime, so a
/// session acquired for a request can be dropped while a later one is
/// still in use.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Database>, DatabaseError>;
}
