//! Daily briefing: overdue tasks, today's tasks and today's events.

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveTime, TimeDelta, Utc};

use crate::calendar::EventFilter;
use crate::error::DatabaseError;
use crate::orchestrator::entities::Entities;
use crate::orchestrator::{IntentHandler, Reply};
use crate::store::Database;
use crate::todos::TodoFilter;

const SECTION_LIMIT: u32 = 50;

pub struct DailyBriefing;

#[async_trait]
impl IntentHandler for DailyBriefing {
    async fn handle(
        &self,
        store: &dyn Database,
        _entities: &Entities,
        _user_text: &str,
    ) -> Result<Reply, DatabaseError> {
        compose(store, Utc::now()).await.map(Reply::text)
    }
}

/// Build the briefing for the UTC day containing `now`.
pub async fn compose(store: &dyn Database, now: DateTime<Utc>) -> Result<String, DatabaseError> {
    let day_start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    let day_end = day_start
        .checked_add_days(Days::new(1))
        .map_or(day_start, |next| next - TimeDelta::microseconds(1));

    let overdue = TodoFilter {
        overdue_before: Some(day_start),
        open_only: true,
        ..Default::default()
    };
    let today = TodoFilter {
        due_after: Some(day_start),
        due_before: Some(day_end),
        open_only: true,
        ..Default::default()
    };
    let events = EventFilter {
        start_after: Some(day_start),
        start_before: Some(day_end),
    };

    let (overdue, _) = store.list_todos(&overdue, 1, SECTION_LIMIT).await?;
    let (today, _) = store.list_todos(&today, 1, SECTION_LIMIT).await?;
    let (events, _) = store.list_events(&events, 1, SECTION_LIMIT).await?;

    let mut sections = vec![format!("**Daily Briefing for {}**", now.format("%B %d, %Y"))];

    if !overdue.is_empty() {
        let mut lines = vec![format!("**Overdue Tasks ({}):**", overdue.len())];
        for todo in &overdue {
            let due = todo
                .due_date
                .map(|d| d.format("%b %d").to_string())
                .unwrap_or_default();
            lines.push(format!("- {} (due {due})", todo.title));
        }
        sections.push(lines.join("\n"));
    }

    if !today.is_empty() {
        let mut lines = vec![format!("**Today's Tasks ({}):**", today.len())];
        lines.extend(
            today
                .iter()
                .map(|t| format!("- [ ] {} ({})", t.title, t.priority)),
        );
        sections.push(lines.join("\n"));
    }

    if !events.is_empty() {
        let mut lines = vec![format!("**Today's Events ({}):**", events.len())];
        for event in &events {
            let location = event
                .location
                .as_deref()
                .map(|l| format!(" at {l}"))
                .unwrap_or_default();
            lines.push(format!(
                "- {}: {}{location}",
                event.start_time.format("%I:%M %p"),
                event.title
            ));
        }
        sections.push(lines.join("\n"));
    }

    if sections.len() == 1 {
        sections.push("Nothing on your plate today.".to_string());
    }
    Ok(sections.join("\n\n"))
}
