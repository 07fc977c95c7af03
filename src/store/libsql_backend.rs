//! libSQL backend: async `Database` implementation over local file and
//! in-memory databases.
//!
//! `LibSqlBackend` owns the database handle and acts as the session factory;
//! every `open()` yields a `LibSqlSession` wrapping its own connection.
//! In-memory databases exist per connection, so in that mode all sessions
//! share one connection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, Value as SqlValue, params};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::calendar::model::{EventFilter, EventItem, EventUpdate};
use crate::chat::model::{Conversation, ConversationSummary, StoredMessage};
use crate::error::DatabaseError;
use crate::llm::Role;
use crate::memos::model::{Memo, MemoUpdate};
use crate::store::migrations;
use crate::store::search::{highlight_snippet, simple_score};
use crate::store::traits::{Database, SearchHit, SearchKind, SessionFactory};
use crate::todos::model::{TodoFilter, TodoItem, TodoUpdate};

/// libSQL database backend and session factory.
pub struct LibSqlBackend {
    db: Arc<LibSqlDatabase>,
    /// Set for in-memory databases.
    shared: Option<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            shared: None,
        };
        let conn = backend.connect().await?;
        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            shared: Some(conn),
        })
    }

    /// A connection for a new session.
    async fn connect(&self) -> Result<Connection, DatabaseError> {
        if let Some(conn) = &self.shared {
            return Ok(conn.clone());
        }
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        // Concurrent sessions on one file wait on each other instead of failing.
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy_timeout: {e}")))?;
        Ok(conn)
    }
}

#[async_trait]
impl SessionFactory for LibSqlBackend {
    async fn open(&self) -> Result<Box<dyn Database>, DatabaseError> {
        let conn = self.connect().await?;
        Ok(Box::new(LibSqlSession::new(conn)))
    }
}

/// One store session over a single connection.
pub struct LibSqlSession {
    conn: Connection,
}

impl LibSqlSession {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn count(&self, sql: &str, args: Vec<SqlValue>) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, Params::Positional(args))
            .await
            .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count row: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format: fixed-width UTC, so text comparison orders correctly.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s))
}

fn tags_to_json(tags: &Option<Vec<String>>) -> Result<Option<String>, DatabaseError> {
    tags.as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn parse_tags(s: Option<String>) -> Option<Vec<String>> {
    s.filter(|s| !s.is_empty())
        .and_then(|s| serde_json::from_str(&s).ok())
}

fn parse_id(s: &str, what: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Query(format!("{what} parse: {e}")))
}

fn offset(page: u32, limit: u32) -> i64 {
    (page.max(1) as i64 - 1) * limit as i64
}

fn paginate<T>(items: Vec<T>, page: u32, limit: u32) -> Vec<T> {
    items
        .into_iter()
        .skip(offset(page, limit) as usize)
        .take(limit as usize)
        .collect()
}

// ── Row mapping ─────────────────────────────────────────────────────

const CONVERSATION_COLUMNS: &str = "id, title, is_archived, created_at, updated_at";

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, role, content, message_type, intent, metadata, created_at";

const TODO_COLUMNS: &str =
    "id, title, description, status, priority, due_date, completed_at, tags, created_at, updated_at";

const EVENT_COLUMNS: &str = "id, title, description, start_time, end_time, location, is_all_day, reminder_minutes, tags, created_at, updated_at";

const MEMO_COLUMNS: &str = "id, title, content, tags, created_at, updated_at";

fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("conversation.id: {e}")))?;
    let created_str: String = row.get(3).unwrap_or_default();
    let updated_str: String = row.get(4).unwrap_or_default();
    Ok(Conversation {
        id: parse_id(&id_str, "conversation.id")?,
        title: row.get(1).unwrap_or_default(),
        is_archived: row.get::<i64>(2).unwrap_or(0) != 0,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("message.id: {e}")))?;
    let conversation_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("message.conversation_id: {e}")))?;
    let role_str: String = row.get(2).unwrap_or_default();
    let role: Role = role_str
        .parse()
        .map_err(|e: String| DatabaseError::Query(format!("message.role: {e}")))?;
    let metadata_str: Option<String> = row.get(6).ok();
    let created_str: String = row.get(7).unwrap_or_default();

    Ok(StoredMessage {
        id: parse_id(&id_str, "message.id")?,
        conversation_id: parse_id(&conversation_str, "message.conversation_id")?,
        role,
        content: row.get(3).unwrap_or_default(),
        message_type: row.get(4).unwrap_or_else(|_| "text".to_string()),
        intent: row.get::<String>(5).ok().filter(|s| !s.is_empty()),
        metadata: metadata_str
            .filter(|s| !s.is_empty())
            .and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_todo(row: &libsql::Row) -> Result<TodoItem, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("todo.id: {e}")))?;
    let title: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("todo.title: {e}")))?;
    let status_str: String = row.get(3).unwrap_or_default();
    let priority_str: String = row.get(4).unwrap_or_default();
    let created_str: String = row.get(8).unwrap_or_default();
    let updated_str: String = row.get(9).unwrap_or_default();

    Ok(TodoItem {
        id: parse_id(&id_str, "todo.id")?,
        title,
        description: row.get::<String>(2).ok().filter(|s| !s.is_empty()),
        status: status_str.parse().unwrap_or_default(),
        priority: priority_str.parse().unwrap_or_default(),
        due_date: parse_optional_datetime(row.get(5).ok()),
        completed_at: parse_optional_datetime(row.get(6).ok()),
        tags: parse_tags(row.get(7).ok()),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_event(row: &libsql::Row) -> Result<EventItem, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("event.id: {e}")))?;
    let title: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("event.title: {e}")))?;
    let start_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("event.start_time: {e}")))?;
    let created_str: String = row.get(9).unwrap_or_default();
    let updated_str: String = row.get(10).unwrap_or_default();

    Ok(EventItem {
        id: parse_id(&id_str, "event.id")?,
        title,
        description: row.get::<String>(2).ok().filter(|s| !s.is_empty()),
        start_time: parse_datetime(&start_str),
        end_time: parse_optional_datetime(row.get(4).ok()),
        location: row.get::<String>(5).ok().filter(|s| !s.is_empty()),
        is_all_day: row.get::<i64>(6).unwrap_or(0) != 0,
        reminder_minutes: row.get::<i64>(7).ok(),
        tags: parse_tags(row.get(8).ok()),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_memo(row: &libsql::Row) -> Result<Memo, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("memo.id: {e}")))?;
    let created_str: String = row.get(4).unwrap_or_default();
    let updated_str: String = row.get(5).unwrap_or_default();

    Ok(Memo {
        id: parse_id(&id_str, "memo.id")?,
        title: row.get(1).unwrap_or_default(),
        content: row.get(2).unwrap_or_default(),
        tags: parse_tags(row.get(3).ok()),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// WHERE clause and positional args for a todo filter.
fn todo_where(filter: &TodoFilter) -> (String, Vec<SqlValue>) {
    let mut clauses: Vec<&str> = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();

    if let Some(status) = filter.status {
        clauses.push("status = ?");
        args.push(status.as_str().into());
    }
    if let Some(priority) = filter.priority {
        clauses.push("priority = ?");
        args.push(priority.as_str().into());
    }
    if let Some(after) = filter.due_after {
        clauses.push("due_date >= ?");
        args.push(ts(after).into());
    }
    if let Some(before) = filter.due_before {
        clauses.push("due_date <= ?");
        args.push(ts(before).into());
    }
    if let Some(before) = filter.overdue_before {
        clauses.push("due_date < ?");
        args.push(ts(before).into());
    }
    if filter.open_only {
        clauses.push("status IN ('pending', 'in_progress')");
    }

    if clauses.is_empty() {
        (String::new(), args)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), args)
    }
}

fn event_where(filter: &EventFilter) -> (String, Vec<SqlValue>) {
    let mut clauses: Vec<&str> = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();

    if let Some(after) = filter.start_after {
        clauses.push("start_time >= ?");
        args.push(ts(after).into());
    }
    if let Some(before) = filter.start_before {
        clauses.push("start_time <= ?");
        args.push(ts(before).into());
    }

    if clauses.is_empty() {
        (String::new(), args)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), args)
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlSession {
    // ── Conversations ───────────────────────────────────────────────

    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO conversations (id, title, is_archived, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conversation.id.to_string(),
                    conversation.title.as_str(),
                    conversation.is_archived as i64,
                    ts(conversation.created_at),
                    ts(conversation.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_conversation: {e}")))?;
        debug!(id = %conversation.id, "Conversation created");
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_conversation(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_conversation row: {e}"))),
        }
    }

    async fn list_conversations(
        &self,
        archived: bool,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<ConversationSummary>, u64), DatabaseError> {
        let total = self
            .count(
                "SELECT COUNT(*) FROM conversations WHERE is_archived = ?",
                vec![(archived as i64).into()],
            )
            .await?;

        let mut rows = self
            .conn()
            .query(
                r#"
                SELECT
                    c.id,
                    c.title,
                    c.updated_at,
                    c.is_archived,
                    (SELECT substr(m.content, 1, 100)
                     FROM messages m
                     WHERE m.conversation_id = c.id
                     ORDER BY m.created_at DESC, m.rowid DESC
                     LIMIT 1
                    ) AS preview
                FROM conversations c
                WHERE c.is_archived = ?1
                ORDER BY c.updated_at DESC
                LIMIT ?2 OFFSET ?3
                "#,
                params![archived as i64, limit as i64, offset(page, limit)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_conversations: {e}")))?;

        let mut items = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row.get(0).unwrap_or_default();
            let updated_str: String = row.get(2).unwrap_or_default();
            items.push(ConversationSummary {
                id: parse_id(&id_str, "conversation.id")?,
                title: row.get(1).unwrap_or_default(),
                updated_at: parse_datetime(&updated_str),
                is_archived: row.get::<i64>(3).unwrap_or(0) != 0,
                last_message_preview: row.get::<String>(4).unwrap_or_default(),
            });
        }
        Ok((items, total))
    }

    async fn archive_conversation(&self, id: Uuid) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE conversations SET is_archived = 1 WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("archive_conversation: {e}")))?;
        if count == 0 {
            return Err(DatabaseError::not_found("Conversation", id));
        }
        Ok(())
    }

    async fn touch_conversation(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                params![id.to_string(), ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_conversation: {e}")))?;
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &StoredMessage) -> Result<(), DatabaseError> {
        let metadata = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO messages (id, conversation_id, role, content, message_type, intent, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    message.id.to_string(),
                    message.conversation_id.to_string(),
                    message.role.as_str(),
                    message.content.as_str(),
                    message.message_type.as_str(),
                    message.intent.clone(),
                    metadata,
                    ts(message.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_message(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_message row: {e}"))),
        }
    }

    async fn finalize_message(
        &self,
        id: Uuid,
        content: &str,
        intent: Option<&str>,
        metadata: Option<&Value>,
    ) -> Result<(), DatabaseError> {
        let metadata = metadata
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let count = self
            .conn()
            .execute(
                "UPDATE messages SET content = ?2, intent = ?3, metadata = ?4 WHERE id = ?1",
                params![id.to_string(), content, intent.map(str::to_string), metadata],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finalize_message: {e}")))?;
        if count == 0 {
            return Err(DatabaseError::not_found("Message", id));
        }
        Ok(())
    }

    async fn update_message_content(
        &self,
        conversation_id: Uuid,
        id: Uuid,
        content: &str,
    ) -> Result<StoredMessage, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE messages SET content = ?3 WHERE id = ?1 AND conversation_id = ?2",
                params![id.to_string(), conversation_id.to_string(), content],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_message_content: {e}")))?;
        if count == 0 {
            return Err(DatabaseError::not_found("Message", id));
        }
        self.touch_conversation(conversation_id).await?;
        self.get_message(id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("Message", id))
    }

    async fn delete_message(&self, conversation_id: Uuid, id: Uuid) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM messages WHERE id = ?1 AND conversation_id = ?2",
                params![id.to_string(), conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_message: {e}")))?;
        if count == 0 {
            return Err(DatabaseError::not_found("Message", id));
        }
        Ok(())
    }

    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE conversation_id = ?1 AND role IN ('user', 'assistant') \
                       AND NOT (role = 'assistant' AND content = '') \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ),
                params![conversation_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            messages.push(row_to_message(&row)?);
        }
        messages.reverse(); // oldest first
        Ok(messages)
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<StoredMessage>, u64), DatabaseError> {
        let total = self
            .count(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?",
                vec![conversation_id.to_string().into()],
            )
            .await?;

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3"
                ),
                params![
                    conversation_id.to_string(),
                    limit as i64,
                    offset(page, limit)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            messages.push(row_to_message(&row)?);
        }
        Ok((messages, total))
    }

    // ── Todos ───────────────────────────────────────────────────────

    async fn list_todos(
        &self,
        filter: &TodoFilter,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<TodoItem>, u64), DatabaseError> {
        let (where_sql, args) = todo_where(filter);
        let total = self
            .count(&format!("SELECT COUNT(*) FROM todos{where_sql}"), args.clone())
            .await?;

        let mut args = args;
        args.push((limit as i64).into());
        args.push(offset(page, limit).into());
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TODO_COLUMNS} FROM todos{where_sql} \
                     ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?"
                ),
                Params::Positional(args),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_todos: {e}")))?;

        let mut todos = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            todos.push(row_to_todo(&row)?);
        }
        Ok((todos, total))
    }

    async fn get_todo(&self, id: Uuid) -> Result<Option<TodoItem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TODO_COLUMNS} FROM todos WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_todo: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_todo(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_todo row: {e}"))),
        }
    }

    async fn create_todo(&self, todo: &TodoItem) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO todos (id, title, description, status, priority, due_date, completed_at, tags, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    todo.id.to_string(),
                    todo.title.as_str(),
                    todo.description.clone(),
                    todo.status.as_str(),
                    todo.priority.as_str(),
                    opt_ts(todo.due_date),
                    opt_ts(todo.completed_at),
                    tags_to_json(&todo.tags)?,
                    ts(todo.created_at),
                    ts(todo.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_todo: {e}")))?;
        debug!(id = %todo.id, "Todo created");
        Ok(())
    }

    async fn update_todo(&self, id: Uuid, update: TodoUpdate) -> Result<TodoItem, DatabaseError> {
        let mut todo = self
            .get_todo(id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("Todo", id))?;
        todo.apply(update);

        self.conn()
            .execute(
                "UPDATE todos SET title = ?2, description = ?3, status = ?4, priority = ?5,
                    due_date = ?6, completed_at = ?7, tags = ?8, updated_at = ?9
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    todo.title.as_str(),
                    todo.description.clone(),
                    todo.status.as_str(),
                    todo.priority.as_str(),
                    opt_ts(todo.due_date),
                    opt_ts(todo.completed_at),
                    tags_to_json(&todo.tags)?,
                    ts(todo.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_todo: {e}")))?;
        debug!(id = %id, status = %todo.status, "Todo updated");
        Ok(todo)
    }

    async fn delete_todo(&self, id: Uuid) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM todos WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_todo: {e}")))?;
        if count == 0 {
            return Err(DatabaseError::not_found("Todo", id));
        }
        Ok(())
    }

    // ── Events ──────────────────────────────────────────────────────

    async fn list_events(
        &self,
        filter: &EventFilter,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<EventItem>, u64), DatabaseError> {
        let (where_sql, args) = event_where(filter);
        let total = self
            .count(&format!("SELECT COUNT(*) FROM events{where_sql}"), args.clone())
            .await?;

        let mut args = args;
        args.push((limit as i64).into());
        args.push(offset(page, limit).into());
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM events{where_sql} \
                     ORDER BY start_time ASC LIMIT ? OFFSET ?"
                ),
                Params::Positional(args),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_events: {e}")))?;

        let mut events = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            events.push(row_to_event(&row)?);
        }
        Ok((events, total))
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<EventItem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_event: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_event(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_event row: {e}"))),
        }
    }

    async fn create_event(&self, event: &EventItem) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO events (id, title, description, start_time, end_time, location, is_all_day, reminder_minutes, tags, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    event.id.to_string(),
                    event.title.as_str(),
                    event.description.clone(),
                    ts(event.start_time),
                    opt_ts(event.end_time),
                    event.location.clone(),
                    event.is_all_day as i64,
                    event.reminder_minutes,
                    tags_to_json(&event.tags)?,
                    ts(event.created_at),
                    ts(event.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_event: {e}")))?;
        debug!(id = %event.id, "Event created");
        Ok(())
    }

    async fn update_event(
        &self,
        id: Uuid,
        update: EventUpdate,
    ) -> Result<EventItem, DatabaseError> {
        let mut event = self
            .get_event(id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("Event", id))?;
        event.apply(update);

        self.conn()
            .execute(
                "UPDATE events SET title = ?2, description = ?3, start_time = ?4, end_time = ?5,
                    location = ?6, is_all_day = ?7, reminder_minutes = ?8, tags = ?9, updated_at = ?10
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    event.title.as_str(),
                    event.description.clone(),
                    ts(event.start_time),
                    opt_ts(event.end_time),
                    event.location.clone(),
                    event.is_all_day as i64,
                    event.reminder_minutes,
                    tags_to_json(&event.tags)?,
                    ts(event.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_event: {e}")))?;
        Ok(event)
    }

    async fn delete_event(&self, id: Uuid) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM events WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_event: {e}")))?;
        if count == 0 {
            return Err(DatabaseError::not_found("Event", id));
        }
        Ok(())
    }

    // ── Memos ───────────────────────────────────────────────────────

    async fn list_memos(&self, page: u32, limit: u32) -> Result<(Vec<Memo>, u64), DatabaseError> {
        let total = self.count("SELECT COUNT(*) FROM memos", Vec::new()).await?;

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MEMO_COLUMNS} FROM memos \
                     ORDER BY updated_at DESC, rowid DESC LIMIT ?1 OFFSET ?2"
                ),
                params![limit as i64, offset(page, limit)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_memos: {e}")))?;

        let mut memos = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            memos.push(row_to_memo(&row)?);
        }
        Ok((memos, total))
    }

    async fn get_memo(&self, id: Uuid) -> Result<Option<Memo>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MEMO_COLUMNS} FROM memos WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_memo: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_memo(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_memo row: {e}"))),
        }
    }

    async fn create_memo(&self, memo: &Memo) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO memos (id, title, content, tags, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    memo.id.to_string(),
                    memo.title.as_str(),
                    memo.content.as_str(),
                    tags_to_json(&memo.tags)?,
                    ts(memo.created_at),
                    ts(memo.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_memo: {e}")))?;
        debug!(id = %memo.id, "Memo created");
        Ok(())
    }

    async fn update_memo(&self, id: Uuid, update: MemoUpdate) -> Result<Memo, DatabaseError> {
        let mut memo = self
            .get_memo(id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("Memo", id))?;
        memo.apply(update);

        self.conn()
            .execute(
                "UPDATE memos SET title = ?2, content = ?3, tags = ?4, updated_at = ?5 WHERE id = ?1",
                params![
                    id.to_string(),
                    memo.title.as_str(),
                    memo.content.as_str(),
                    tags_to_json(&memo.tags)?,
                    ts(memo.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_memo: {e}")))?;
        Ok(memo)
    }

    async fn delete_memo(&self, id: Uuid) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM memos WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_memo: {e}")))?;
        if count == 0 {
            return Err(DatabaseError::not_found("Memo", id));
        }
        Ok(())
    }

    // ── Search ──────────────────────────────────────────────────────

    async fn search(
        &self,
        query: &str,
        kinds: &[SearchKind],
        page: u32,
        limit: u32,
    ) -> Result<(Vec<SearchHit>, u64), DatabaseError> {
        let term = query.trim();
        if term.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let mut hits = Vec::new();
        for kind in SearchKind::ALL {
            if kinds.contains(&kind) {
                hits.extend(self.search_kind(kind, term).await?);
            }
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        let total = hits.len() as u64;
        Ok((paginate(hits, page, limit), total))
    }
}

impl LibSqlSession {
    /// All hits of one kind, unranked.
    async fn search_kind(&self, kind: SearchKind, term: &str) -> Result<Vec<SearchHit>, DatabaseError> {
        let sql = match kind {
            SearchKind::Todos => format!(
                "SELECT {TODO_COLUMNS} FROM todos \
                 WHERE instr(lower(title), lower(?1)) > 0 \
                    OR instr(lower(coalesce(description, '')), lower(?1)) > 0"
            ),
            SearchKind::Events => format!(
                "SELECT {EVENT_COLUMNS} FROM events \
                 WHERE instr(lower(title), lower(?1)) > 0 \
                    OR instr(lower(coalesce(description, '')), lower(?1)) > 0 \
                    OR instr(lower(coalesce(location, '')), lower(?1)) > 0"
            ),
            SearchKind::Memos => format!(
                "SELECT {MEMO_COLUMNS} FROM memos \
                 WHERE instr(lower(title), lower(?1)) > 0 \
                    OR instr(lower(content), lower(?1)) > 0"
            ),
            SearchKind::Messages => "SELECT m.id, m.conversation_id, m.role, m.content, m.message_type, \
                    m.intent, m.metadata, m.created_at, c.title \
                 FROM messages m LEFT JOIN conversations c ON c.id = m.conversation_id \
                 WHERE instr(lower(m.content), lower(?1)) > 0"
                .to_string(),
        };

        let mut rows = self
            .conn()
            .query(&sql, params![term])
            .await
            .map_err(|e| DatabaseError::Query(format!("search {}: {e}", kind.label())))?;

        let mut hits = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let hit = match kind {
                SearchKind::Todos => {
                    let todo = row_to_todo(&row)?;
                    let combined = format!("{} {}", todo.title, todo.description.as_deref().unwrap_or(""));
                    SearchHit {
                        kind: kind.label(),
                        id: todo.id,
                        snippet: highlight_snippet(todo.description.as_deref().unwrap_or(&todo.title), term),
                        score: simple_score(&combined, term),
                        title: todo.title,
                        created_at: todo.created_at,
                    }
                }
                SearchKind::Events => {
                    let event = row_to_event(&row)?;
                    let combined = format!(
                        "{} {} {}",
                        event.title,
                        event.description.as_deref().unwrap_or(""),
                        event.location.as_deref().unwrap_or("")
                    );
                    SearchHit {
                        kind: kind.label(),
                        id: event.id,
                        snippet: highlight_snippet(event.description.as_deref().unwrap_or(&event.title), term),
                        score: simple_score(&combined, term),
                        title: event.title,
                        created_at: event.created_at,
                    }
                }
                SearchKind::Memos => {
                    let memo = row_to_memo(&row)?;
                    let combined = format!("{} {}", memo.title, memo.content);
                    SearchHit {
                        kind: kind.label(),
                        id: memo.id,
                        snippet: highlight_snippet(&memo.content, term),
                        score: simple_score(&combined, term),
                        title: memo.title,
                        created_at: memo.created_at,
                    }
                }
                SearchKind::Messages => {
                    let message = row_to_message(&row)?;
                    let conversation_title = row
                        .get::<String>(8)
                        .unwrap_or_else(|_| "Unknown Conversation".to_string());
                    SearchHit {
                        kind: kind.label(),
                        id: message.id,
                        title: format!("[{}] in {}", message.role, conversation_title),
                        snippet: highlight_snippet(&message.content, term),
                        score: simple_score(&message.content, term),
                        created_at: message.created_at,
                    }
                }
            };
            hits.push(hit);
        }
        Ok(hits)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
