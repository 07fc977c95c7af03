//! HTTP surface: conversation management, message history and edits, the
//! streaming turn endpoint and a health check.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::chat::model::{Conversation, ConversationSummary, StoredMessage};
use crate::chat::turn::ChatService;
use crate::error::ApiError;
use crate::store::Database;
use crate::store::search::take_chars;

const PREVIEW_CHARS: usize = 100;
const MAX_PAGE_SIZE: u32 = 100;

/// Shared state for every route.
#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub ai_provider: String,
    pub ai_model: String,
}

/// All ClawChat routes with permissive CORS.
pub fn chat_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/chat/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/api/chat/conversations/{id}",
            get(get_conversation).delete(archive_conversation),
        )
        .route("/api/chat/conversations/{id}/messages", get(list_messages))
        .route(
            "/api/chat/conversations/{id}/messages/{message_id}",
            put(edit_message).delete(delete_message),
        )
        .route("/api/chat/stream", post(stream_turn))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Request / response shapes ────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct CreateConversation {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    page: Option<u32>,
    limit: Option<u32>,
    #[serde(default)]
    archived: bool,
}

impl PageParams {
    fn resolve(&self, default_limit: u32) -> Result<(u32, u32), ApiError> {
        let page = self.page.unwrap_or(1);
        let limit = self.limit.unwrap_or(default_limit);
        if page == 0 {
            return Err(ApiError::BadRequest("page must be at least 1".into()));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(ApiError::BadRequest(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        Ok((page, limit))
    }
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Deserialize)]
pub struct StreamRequest {
    pub conversation_id: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct EditMessage {
    pub content: String,
}

/// Path ids that are not UUIDs cannot name anything, so they are 404s.
fn parse_id(raw: &str, entity: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::NotFound(entity.into()))
}

fn conversation_id(raw: &str) -> Result<Uuid, ApiError> {
    parse_id(raw, "Conversation")
}

async fn require_conversation(store: &dyn Database, id: Uuid) -> Result<(), ApiError> {
    match store.get_conversation(id).await? {
        Some(_) => Ok(()),
        None => Err(ApiError::NotFound("Conversation".into())),
    }
}

async fn summarize(
    store: &dyn Database,
    conversation: Conversation,
) -> Result<ConversationSummary, ApiError> {
    let (latest, _) = store.list_messages(conversation.id, 1, 1).await?;
    Ok(ConversationSummary {
        id: conversation.id,
        title: conversation.title,
        updated_at: conversation.updated_at,
        last_message_preview: latest
            .first()
            .map(|m| take_chars(&m.content, PREVIEW_CHARS))
            .unwrap_or_default(),
        is_archived: conversation.is_archived,
    })
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "ai_provider": state.ai_provider,
        "ai_model": state.ai_model,
    }))
}

async fn create_conversation(
    State(state): State<AppState>,
    body: Option<Json<CreateConversation>>,
) -> Result<(StatusCode, Json<ConversationSummary>), ApiError> {
    let Json(body) = body.unwrap_or_default();
    let conversation = Conversation::new(body.title);
    let store = state.chat.sessions().open().await?;
    store.create_conversation(&conversation).await?;
    tracing::info!(conversation_id = %conversation.id, "Conversation created");
    let summary = summarize(store.as_ref(), conversation).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn list_conversations(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Json<Page<ConversationSummary>>, ApiError> {
    let (page, limit) = params.resolve(20)?;
    let store = state.chat.sessions().open().await?;
    let (items, total) = store
        .list_conversations(params.archived, page, limit)
        .await?;
    Ok(Json(Page {
        items,
        total,
        page,
        limit,
    }))
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationSummary>, ApiError> {
    let id = conversation_id(&id)?;
    let store = state.chat.sessions().open().await?;
    let conversation = store
        .get_conversation(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Conversation".into()))?;
    Ok(Json(summarize(store.as_ref(), conversation).await?))
}

async fn archive_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = conversation_id(&id)?;
    let store = state.chat.sessions().open().await?;
    store.archive_conversation(id).await?;
    tracing::info!(conversation_id = %id, "Conversation archived");
    Ok(Json(json!({ "detail": "Conversation archived" })))
}

async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<Page<StoredMessage>>, ApiError> {
    let id = conversation_id(&id)?;
    let (page, limit) = params.resolve(50)?;
    let store = state.chat.sessions().open().await?;
    require_conversation(store.as_ref(), id).await?;
    let (items, total) = store.list_messages(id, page, limit).await?;
    Ok(Json(Page {
        items,
        total,
        page,
        limit,
    }))
}

async fn edit_message(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(String, String)>,
    Json(body): Json<EditMessage>,
) -> Result<Json<StoredMessage>, ApiError> {
    let id = conversation_id(&id)?;
    let message_id = parse_id(&message_id, "Message")?;
    let store = state.chat.sessions().open().await?;
    require_conversation(store.as_ref(), id).await?;
    let message = store
        .update_message_content(id, message_id, &body.content)
        .await?;
    tracing::info!(conversation_id = %id, message_id = %message_id, "Message edited");
    Ok(Json(message))
}

async fn delete_message(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let id = conversation_id(&id)?;
    let message_id = parse_id(&message_id, "Message")?;
    let store = state.chat.sessions().open().await?;
    require_conversation(store.as_ref(), id).await?;
    store.delete_message(id, message_id).await?;
    tracing::info!(conversation_id = %id, message_id = %message_id, "Message deleted");
    Ok(Json(json!({ "detail": "Message deleted" })))
}

/// Run a turn and stream it as server-sent events.
///
/// Everything that can fail with an HTTP status happens before the first
/// event. The turn itself runs on its own task and outlives the connection.
async fn stream_turn(
    State(state): State<AppState>,
    Json(body): Json<StreamRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.content.trim().is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".into()));
    }
    let id = conversation_id(&body.conversation_id)?;
    let turn = state.chat.begin(id, &body.content).await?;
    tracing::info!(
        conversation_id = %id,
        message_id = %turn.message_id(),
        "Streaming turn"
    );

    let (rx, _turn) = turn.spawn();

    let events = ReceiverStream::new(rx)
        .map(|event| Ok::<_, Infallible>(Event::default().data(event.data())));

    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(events).keep_alive(KeepAlive::default()),
    ))
}
