//! Todo intents.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::cards::{ActionCard, CardAction, CardType};
use crate::error::DatabaseError;
use crate::orchestrator::entities::{self, Entities, UpdateFields};
use crate::orchestrator::{IntentHandler, Reply};
use crate::store::Database;
use crate::todos::{TodoFilter, TodoItem, TodoPriority, TodoStatus, TodoUpdate};

const LIST_LIMIT: u32 = 10;

fn card_base(todo: &TodoItem) -> Value {
    json!({
        "id": todo.id,
        "title": todo.title,
        "status": todo.status,
        "priority": todo.priority,
    })
}

pub struct CreateTodo;

#[async_trait]
impl IntentHandler for CreateTodo {
    async fn handle(
        &self,
        store: &dyn Database,
        entities: &Entities,
        user_text: &str,
    ) -> Result<Reply, DatabaseError> {
        let title = entities::string(entities, "title").unwrap_or_else(|| user_text.to_string());
        let priority = entities::string(entities, "priority")
            .and_then(|p| p.parse::<TodoPriority>().ok())
            .unwrap_or_default();

        let mut todo = TodoItem::new(title).with_priority(priority);
        todo.description = entities::string(entities, "description");
        todo.due_date = entities.get("due_date").and_then(entities::parse_datetime);
        todo.tags = entities.get("tags").and_then(entities::tags);
        store.create_todo(&todo).await?;
        tracing::info!(todo_id = %todo.id, "Created todo from chat");

        let card = ActionCard::new(CardType::TodoCreated)
            .with_payload(json!({
                "id": todo.id,
                "title": todo.title,
                "status": todo.status,
                "priority": todo.priority,
                "due_date": todo.due_date,
                "tags": todo.tags,
            }))
            .with_action(CardAction::for_id("Edit", "edit_todo", todo.id))
            .with_action(CardAction::for_id("Complete", "complete_todo", todo.id))
            .with_action(CardAction::for_id("Delete", "delete_todo", todo.id));

        Ok(Reply::text(format!("I've created a new task: \"{}\".", todo.title)).with_card(card))
    }
}

pub struct QueryTodos;

#[async_trait]
impl IntentHandler for QueryTodos {
    async fn handle(
        &self,
        store: &dyn Database,
        entities: &Entities,
        _user_text: &str,
    ) -> Result<Reply, DatabaseError> {
        let filter = TodoFilter {
            status: entities::string(entities, "status").and_then(|s| s.parse().ok()),
            priority: entities::string(entities, "priority").and_then(|p| p.parse().ok()),
            due_before: entities.get("due_before").and_then(entities::parse_datetime),
            ..Default::default()
        };
        let (todos, total) = store.list_todos(&filter, 1, LIST_LIMIT).await?;
        if todos.is_empty() {
            return Ok(Reply::text("I couldn't find any matching tasks."));
        }

        let mut lines = vec![format!("Found {total} task(s):")];
        for todo in &todos {
            let check = if todo.status == TodoStatus::Completed { "x" } else { " " };
            lines.push(format!("- [{check}] **{}** ({})", todo.title, todo.priority));
        }
        Ok(Reply::text(lines.join("\n")))
    }
}

pub struct UpdateTodo;

#[async_trait]
impl IntentHandler for UpdateTodo {
    async fn handle(
        &self,
        store: &dyn Database,
        entities: &Entities,
        _user_text: &str,
    ) -> Result<Reply, DatabaseError> {
        let Some(id) = entities::target_id(entities, "Todo")? else {
            return Ok(Reply::text(
                "I need to know which task to update. Could you specify the task?",
            ));
        };

        let fields = UpdateFields::new(entities);
        let update = TodoUpdate {
            title: fields.string("title"),
            description: fields.string("description"),
            status: fields.string("status").and_then(|s| s.parse().ok()),
            priority: fields.string("priority").and_then(|p| p.parse().ok()),
            due_date: fields.datetime("due_date"),
            tags: fields.tags("tags"),
        };
        if update.is_empty() {
            return Ok(Reply::text("What would you like to change about this task?"));
        }

        let todo = store.update_todo(id, update).await?;
        let card = ActionCard::new(CardType::TodoUpdated).with_payload(card_base(&todo));
        Ok(Reply::text(format!("Updated task: \"{}\".", todo.title)).with_card(card))
    }
}

pub struct DeleteTodo;

#[async_trait]
impl IntentHandler for DeleteTodo {
    async fn handle(
        &self,
        store: &dyn Database,
        entities: &Entities,
        _user_text: &str,
    ) -> Result<Reply, DatabaseError> {
        let Some(id) = entities::target_id(entities, "Todo")? else {
            return Ok(Reply::text("Which task would you like to delete?"));
        };
        let todo = store
            .get_todo(id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("Todo", id))?;
        store.delete_todo(id).await?;
        Ok(Reply::text(format!("Deleted task: \"{}\".", todo.title)))
    }
}

pub struct CompleteTodo;

#[async_trait]
impl IntentHandler for CompleteTodo {
    async fn handle(
        &self,
        store: &dyn Database,
        entities: &Entities,
        _user_text: &str,
    ) -> Result<Reply, DatabaseError> {
        let Some(id) = entities::target_id(entities, "Todo")? else {
            return Ok(Reply::text("Which task would you like to mark as complete?"));
        };
        let update = TodoUpdate {
            status: Some(TodoStatus::Completed),
            ..Default::default()
        };
        let todo = store.update_todo(id, update).await?;
        let card = ActionCard::new(CardType::TodoCompleted).with_payload(json!({
            "id": todo.id,
            "title": todo.title,
            "status": TodoStatus::Completed,
            "completed_at": todo.completed_at,
        }));
        Ok(Reply::text(format!("Marked \"{}\" as completed!", todo.title)).with_card(card))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::test_support::{entities, store};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    async fn open_count(store: &dyn Database) -> u64 {
        store.list_todos(&TodoFilter::default(), 1, 100).await.unwrap().1
    }

    #[tokio::test]
    async fn create_with_unparseable_due_date_leaves_it_empty() {
        let store = store().await;
        let reply = CreateTodo
            .handle(
                store.as_ref(),
                &entities(json!({"title": "call mom", "due_date": "tomorrow 5pm"})),
                "remind me to call mom tomorrow 5pm",
            )
            .await
            .unwrap();

        assert_eq!(reply.text, "I've created a new task: \"call mom\".");
        let card = reply.card.unwrap();
        assert_eq!(card.card_type, CardType::TodoCreated);
        assert_eq!(card.actions.len(), 3);
        assert_eq!(card.payload["due_date"], Value::Null);

        let id: Uuid = card.payload["id"].as_str().unwrap().parse().unwrap();
        let todo = store.get_todo(id).await.unwrap().unwrap();
        assert_eq!(todo.title, "call mom");
        assert!(todo.due_date.is_none());
        assert_eq!(todo.priority, TodoPriority::Medium);
    }

    #[tokio::test]
    async fn create_falls_back_to_raw_text_and_medium_priority() {
        let store = store().await;
        let reply = CreateTodo
            .handle(
                store.as_ref(),
                &entities(json!({"priority": "critical", "tags": "home, chores"})),
                "water the plants",
            )
            .await
            .unwrap();
        assert_eq!(reply.text, "I've created a new task: \"water the plants\".");
        let card = reply.card.unwrap();
        assert_eq!(card.payload["priority"], "medium");
        assert_eq!(card.payload["tags"], json!(["home", "chores"]));
    }

    #[tokio::test]
    async fn complete_without_id_asks_and_changes_nothing() {
        let store = store().await;
        store.create_todo(&TodoItem::new("Existing")).await.unwrap();

        let reply = CompleteTodo
            .handle(store.as_ref(), &entities(json!({})), "mark it done")
            .await
            .unwrap();
        assert_eq!(reply.text, "Which task would you like to mark as complete?");
        assert!(reply.card.is_none());

        let (todos, _) = store.list_todos(&TodoFilter::default(), 1, 10).await.unwrap();
        assert_eq!(todos[0].status, TodoStatus::Pending);
    }

    #[tokio::test]
    async fn update_and_delete_without_id_ask_for_clarification() {
        let store = store().await;
        store.create_todo(&TodoItem::new("Keep me")).await.unwrap();

        let reply = UpdateTodo
            .handle(store.as_ref(), &entities(json!({"title": "Renamed"})), "rename it")
            .await
            .unwrap();
        assert_eq!(
            reply.text,
            "I need to know which task to update. Could you specify the task?"
        );

        let reply = DeleteTodo
            .handle(store.as_ref(), &entities(json!({})), "delete it")
            .await
            .unwrap();
        assert_eq!(reply.text, "Which task would you like to delete?");

        let (todos, total) = store.list_todos(&TodoFilter::default(), 1, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(todos[0].title, "Keep me");
    }

    #[tokio::test]
    async fn update_reads_nested_fields_and_rejects_empty_changes() {
        let store = store().await;
        let todo = TodoItem::new("Draft report");
        store.create_todo(&todo).await.unwrap();

        let reply = UpdateTodo
            .handle(
                store.as_ref(),
                &entities(json!({"id": todo.id.to_string()})),
                "change it",
            )
            .await
            .unwrap();
        assert_eq!(reply.text, "What would you like to change about this task?");

        let reply = UpdateTodo
            .handle(
                store.as_ref(),
                &entities(json!({
                    "id": todo.id.to_string(),
                    "updates": {"title": "Final report", "priority": "high", "due_date": "2026-05-01"}
                })),
                "rename it",
            )
            .await
            .unwrap();
        assert_eq!(reply.text, "Updated task: \"Final report\".");
        assert_eq!(reply.card.unwrap().card_type, CardType::TodoUpdated);

        let stored = store.get_todo(todo.id).await.unwrap().unwrap();
        assert_eq!(stored.priority, TodoPriority::High);
        assert_eq!(stored.due_date, Some(Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()));
    }

    #[tokio::test]
    async fn complete_sets_completed_at_on_card() {
        let store = store().await;
        let todo = TodoItem::new("Pay rent");
        store.create_todo(&todo).await.unwrap();

        let reply = CompleteTodo
            .handle(store.as_ref(), &entities(json!({"id": todo.id.to_string()})), "paid")
            .await
            .unwrap();
        assert_eq!(reply.text, "Marked \"Pay rent\" as completed!");
        let card = reply.card.unwrap();
        assert_eq!(card.card_type, CardType::TodoCompleted);
        assert_eq!(card.payload["status"], "completed");
        assert!(card.payload["completed_at"].is_string());
    }

    #[tokio::test]
    async fn delete_missing_todo_is_not_found() {
        let store = store().await;
        store.create_todo(&TodoItem::new("Survivor")).await.unwrap();
        let err = DeleteTodo
            .handle(
                store.as_ref(),
                &entities(json!({"id": Uuid::new_v4().to_string()})),
                "delete it",
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(open_count(store.as_ref()).await, 1);
    }

    #[tokio::test]
    async fn query_lists_with_checkboxes() {
        let store = store().await;
        let done = TodoItem::new("Old chore");
        store.create_todo(&done).await.unwrap();
        store
            .update_todo(
                done.id,
                TodoUpdate {
                    status: Some(TodoStatus::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .create_todo(&TodoItem::new("Book flights").with_priority(TodoPriority::Urgent))
            .await
            .unwrap();

        let reply = QueryTodos
            .handle(store.as_ref(), &entities(json!({})), "what are my tasks")
            .await
            .unwrap();
        assert!(reply.text.starts_with("Found 2 task(s):"));
        assert!(reply.text.contains("- [ ] **Book flights** (urgent)"));
        assert!(reply.text.contains("- [x] **Old chore** (medium)"));

        let reply = QueryTodos
            .handle(store.as_ref(), &entities(json!({"priority": "low"})), "low ones")
            .await
            .unwrap();
        assert_eq!(reply.text, "I couldn't find any matching tasks.");
    }
}
