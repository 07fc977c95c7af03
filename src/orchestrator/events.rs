//! Calendar event intents.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use crate::calendar::{EventFilter, EventItem, EventUpdate};
use crate::cards::{ActionCard, CardAction, CardType};
use crate::error::DatabaseError;
use crate::orchestrator::entities::{self, Entities, UpdateFields};
use crate::orchestrator::{IntentHandler, Reply};
use crate::store::Database;

const LIST_LIMIT: u32 = 10;

fn card_payload(event: &EventItem) -> Value {
    json!({
        "id": event.id,
        "title": event.title,
        "start_time": event.start_time,
        "end_time": event.end_time,
        "location": event.location,
    })
}

pub struct CreateEvent;

#[async_trait]
impl IntentHandler for CreateEvent {
    async fn handle(
        &self,
        store: &dyn Database,
        entities: &Entities,
        user_text: &str,
    ) -> Result<Reply, DatabaseError> {
        let title = entities::string(entities, "title").unwrap_or_else(|| user_text.to_string());
        let start = entities
            .get("start_time")
            .and_then(entities::parse_datetime)
            .unwrap_or_else(Utc::now);

        let mut event = EventItem::new(title, start);
        event.description = entities::string(entities, "description");
        event.end_time = entities.get("end_time").and_then(entities::parse_datetime);
        event.location = entities::string(entities, "location");
        event.is_all_day = entities
            .get("is_all_day")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        event.reminder_minutes = entities.get("reminder_minutes").and_then(Value::as_i64);
        event.tags = entities.get("tags").and_then(entities::tags);
        store.create_event(&event).await?;
        tracing::info!(event_id = %event.id, "Created event from chat");

        let card = ActionCard::new(CardType::EventCreated)
            .with_payload(card_payload(&event))
            .with_action(CardAction::for_id("Edit", "edit_event", event.id))
            .with_action(CardAction::for_id("Delete", "delete_event", event.id));

        Ok(Reply::text(format!(
            "I've scheduled \"{}\" for {}.",
            event.title,
            event.start_time.format("%B %d at %I:%M %p")
        ))
        .with_card(card))
    }
}

pub struct QueryEvents;

#[async_trait]
impl IntentHandler for QueryEvents {
    async fn handle(
        &self,
        store: &dyn Database,
        entities: &Entities,
        _user_text: &str,
    ) -> Result<Reply, DatabaseError> {
        let filter = EventFilter {
            start_after: entities.get("start_after").and_then(entities::parse_datetime),
            start_before: entities.get("start_before").and_then(entities::parse_datetime),
        };
        let (events, total) = store.list_events(&filter, 1, LIST_LIMIT).await?;
        if events.is_empty() {
            return Ok(Reply::text("I couldn't find any matching events."));
        }

        let mut lines = vec![format!("Found {total} event(s):")];
        lines.extend(events.iter().map(|e| {
            format!("- **{}** at {}", e.title, e.start_time.format("%b %d, %I:%M %p"))
        }));
        Ok(Reply::text(lines.join("\n")))
    }
}

pub struct UpdateEvent;

#[async_trait]
impl IntentHandler for UpdateEvent {
    async fn handle(
        &self,
        store: &dyn Database,
        entities: &Entities,
        _user_text: &str,
    ) -> Result<Reply, DatabaseError> {
        let Some(id) = entities::target_id(entities, "Event")? else {
            return Ok(Reply::text("Which event would you like to update?"));
        };

        let fields = UpdateFields::new(entities);
        let update = EventUpdate {
            title: fields.string("title"),
            description: fields.string("description"),
            // start_time cannot be cleared
            start_time: fields.datetime("start_time").flatten(),
            end_time: fields.datetime("end_time"),
            location: fields.string("location"),
            is_all_day: fields.bool("is_all_day"),
            reminder_minutes: fields.int("reminder_minutes"),
            tags: fields.tags("tags"),
        };
        if update.is_empty() {
            return Ok(Reply::text("What would you like to change about this event?"));
        }

        let event = store.update_event(id, update).await?;
        let card = ActionCard::new(CardType::EventUpdated).with_payload(card_payload(&event));
        Ok(Reply::text(format!("Updated event: \"{}\".", event.title)).with_card(card))
    }
}

pub struct DeleteEvent;

#[async_trait]
impl IntentHandler for DeleteEvent {
    async fn handle(
        &self,
        store: &dyn Database,
        entities: &Entities,
        _user_text: &str,
    ) -> Result<Reply, DatabaseError> {
        let Some(id) = entities::target_id(entities, "Event")? else {
            return Ok(Reply::text("Which event would you like to delete?"));
        };
        let event = store
            .get_event(id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("Event", id))?;
        store.delete_event(id).await?;
        Ok(Reply::text(format!("Deleted event: \"{}\".", event.title)))
    }
}
