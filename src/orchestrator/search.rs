//! Cross-kind search intent.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::DatabaseError;
use crate::orchestrator::entities::{self, Entities};
use crate::orchestrator::{IntentHandler, Reply};
use crate::store::search::take_chars;
use crate::store::{Database, SearchKind};

const RESULT_LIMIT: u32 = 10;
const SNIPPET: usize = 80;

/// Requested kinds from `entities.types`. Without a selection every kind is
/// searched; unknown names select nothing.
fn requested_kinds(value: Option<&Value>) -> Vec<SearchKind> {
    let Some(names) = value.and_then(entities::tags) else {
        return SearchKind::ALL.to_vec();
    };
    let mut kinds: Vec<SearchKind> = Vec::new();
    for name in &names {
        match name.parse() {
            Ok(kind) if !kinds.contains(&kind) => kinds.push(kind),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Ignoring search kind"),
        }
    }
    kinds
}

pub struct Search;

#[async_trait]
impl IntentHandler for Search {
    async fn handle(
        &self,
        store: &dyn Database,
        entities: &Entities,
        user_text: &str,
    ) -> Result<Reply, DatabaseError> {
        let query = entities::string(entities, "query").unwrap_or_else(|| user_text.to_string());
        let kinds = requested_kinds(entities.get("types"));

        let (hits, total) = store.search(&query, &kinds, 1, RESULT_LIMIT).await?;
        if hits.is_empty() {
            return Ok(Reply::text(format!("No results found for \"{query}\".")));
        }

        let mut lines = vec![format!("Found {total} result(s) for \"{query}\":")];
        lines.extend(hits.iter().map(|hit| {
            format!(
                "- [{}] **{}**: {}",
                hit.kind,
                hit.title,
                take_chars(&hit.snippet, SNIPPET)
            )
        }));
        Ok(Reply::text(lines.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memos::Memo;
    use crate::orchestrator::test_support::{entities, store};
    use crate::todos::TodoItem;
    use serde_json::json;

    #[test]
    fn kinds_from_list_or_string() {
        assert_eq!(
            requested_kinds(Some(&json!(["todos", "memo"]))),
            vec![SearchKind::Todos, SearchKind::Memos]
        );
        assert_eq!(
            requested_kinds(Some(&json!("events, messages"))),
            vec![SearchKind::Events, SearchKind::Messages]
        );
        assert_eq!(
            requested_kinds(Some(&json!(["memos", "bogus", "memo"]))),
            vec![SearchKind::Memos]
        );
        assert!(requested_kinds(Some(&json!(["bogus"]))).is_empty());
        assert_eq!(requested_kinds(None), SearchKind::ALL.to_vec());
    }

    #[tokio::test]
    async fn formats_hits_and_respects_kinds() {
        let store = store().await;
        store
            .create_todo(&TodoItem::new("Renew passport"))
            .await
            .unwrap();
        store
            .create_memo(&Memo::new("Travel", "passport is in the top drawer"))
            .await
            .unwrap();

        let reply = Search
            .handle(store.as_ref(), &entities(json!({"query": "passport"})), "find passport")
            .await
            .unwrap();
        assert!(reply.text.starts_with("Found 2 result(s) for \"passport\":"));
        assert!(reply.text.contains("- [todo] **Renew passport**: "));
        assert!(reply.text.contains("- [memo] **Travel**: "));
        assert!(reply.card.is_none());

        let reply = Search
            .handle(
                store.as_ref(),
                &entities(json!({"query": "passport", "types": "memos"})),
                "find passport",
            )
            .await
            .unwrap();
        assert!(reply.text.starts_with("Found 1 result(s)"));
        assert!(!reply.text.contains("[todo]"));
    }

    #[tokio::test]
    async fn unknown_kinds_find_nothing() {
        let store = store().await;
        store
            .create_todo(&TodoItem::new("Renew passport"))
            .await
            .unwrap();

        let reply = Search
            .handle(
                store.as_ref(),
                &entities(json!({"query": "passport", "types": ["passports"]})),
                "find passport",
            )
            .await
            .unwrap();
        assert_eq!(reply.text, "No results found for \"passport\".");
    }

    #[tokio::test]
    async fn no_results_message_uses_raw_text() {
        let store = store().await;
        let reply = Search
            .handle(store.as_ref(), &entities(json!({})), "unicorns")
            .await
            .unwrap();
        assert_eq!(reply.text, "No results found for \"unicorns\".");
    }
}
