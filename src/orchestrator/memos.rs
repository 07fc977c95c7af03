//! Memo intents.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::cards::{ActionCard, CardAction, CardType};
use crate::error::DatabaseError;
use crate::memos::{Memo, MemoUpdate};
use crate::orchestrator::entities::{self, Entities, UpdateFields};
use crate::orchestrator::{IntentHandler, Reply};
use crate::store::Database;
use crate::store::search::take_chars;

const LIST_LIMIT: u32 = 10;
const TITLE_FROM_CONTENT: usize = 50;
const CARD_CONTENT: usize = 200;
const PREVIEW: usize = 60;

fn card_payload(memo: &Memo) -> Value {
    json!({
        "id": memo.id,
        "title": memo.title,
        "content": take_chars(&memo.content, CARD_CONTENT),
    })
}

fn preview(content: &str) -> String {
    if content.chars().count() > PREVIEW {
        format!("{}...", take_chars(content, PREVIEW))
    } else {
        content.to_string()
    }
}

pub struct CreateMemo;

#[async_trait]
impl IntentHandler for CreateMemo {
    async fn handle(
        &self,
        store: &dyn Database,
        entities: &Entities,
        user_text: &str,
    ) -> Result<Reply, DatabaseError> {
        let content =
            entities::string(entities, "content").unwrap_or_else(|| user_text.to_string());
        let title = entities::string(entities, "title")
            .unwrap_or_else(|| take_chars(&content, TITLE_FROM_CONTENT));

        let mut memo = Memo::new(title, content);
        memo.tags = entities.get("tags").and_then(entities::tags);
        store.create_memo(&memo).await?;
        tracing::info!(memo_id = %memo.id, "Created memo from chat");

        let card = ActionCard::new(CardType::MemoCreated)
            .with_payload(card_payload(&memo))
            .with_action(CardAction::for_id("Edit", "edit_memo", memo.id))
            .with_action(CardAction::for_id("Delete", "delete_memo", memo.id));

        Ok(Reply::text(format!("I've saved your memo: \"{}\".", memo.title)).with_card(card))
    }
}

pub struct QueryMemos;

#[async_trait]
impl IntentHandler for QueryMemos {
    async fn handle(
        &self,
        store: &dyn Database,
        _entities: &Entities,
        _user_text: &str,
    ) -> Result<Reply, DatabaseError> {
        let (memos, total) = store.list_memos(1, LIST_LIMIT).await?;
        if memos.is_empty() {
            return Ok(Reply::text("You don't have any memos yet."));
        }

        let mut lines = vec![format!("Found {total} memo(s):")];
        lines.extend(
            memos
                .iter()
                .map(|m| format!("- **{}**: {}", m.title, preview(&m.content))),
        );
        Ok(Reply::text(lines.join("\n")))
    }
}

pub struct UpdateMemo;

#[async_trait]
impl IntentHandler for UpdateMemo {
    async fn handle(
        &self,
        store: &dyn Database,
        entities: &Entities,
        _user_text: &str,
    ) -> Result<Reply, DatabaseError> {
        let Some(id) = entities::target_id(entities, "Memo")? else {
            return Ok(Reply::text("Which memo would you like to update?"));
        };

        let fields = UpdateFields::new(entities);
        let update = MemoUpdate {
            title: fields.string("title"),
            content: fields.string("content"),
            tags: fields.tags("tags"),
        };
        if update.is_empty() {
            return Ok(Reply::text("What would you like to change about this memo?"));
        }

        let memo = store.update_memo(id, update).await?;
        let card = ActionCard::new(CardType::MemoUpdated).with_payload(card_payload(&memo));
        Ok(Reply::text(format!("Updated memo: \"{}\".", memo.title)).with_card(card))
    }
}

pub struct DeleteMemo;

#[async_trait]
impl IntentHandler for DeleteMemo {
    async fn handle(
        &self,
        store: &dyn Database,
        entities: &Entities,
        _user_text: &str,
    ) -> Result<Reply, DatabaseError> {
        let Some(id) = entities::target_id(entities, "Memo")? else {
            return Ok(Reply::text("Which memo would you like to delete?"));
        };
        let memo = store
            .get_memo(id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("Memo", id))?;
        store.delete_memo(id).await?;
        Ok(Reply::text(format!("Deleted memo: \"{}\".", memo.title)))
    }
}
