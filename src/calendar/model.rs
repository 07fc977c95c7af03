//! Calendar event data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A scheduled calendar event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventItem {
    pub id: Uuid,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub is_all_day: bool,
    /// Minutes before `start_time` to remind the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reminder_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventItem {
    pub fn new(title: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: None,
            start_time,
            end_time: None,
            location: None,
            is_all_day: false,
            reminder_minutes: None,
            tags: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set location.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, update: EventUpdate) {
        if let Some(title) = update.title {
            self.title = title;
        }
        if let Some(description) = update.description {
            self.description = Some(description);
        }
        if let Some(start_time) = update.start_time {
            self.start_time = start_time;
        }
        if let Some(end_time) = update.end_time {
            self.end_time = end_time;
        }
        if let Some(location) = update.location {
            self.location = Some(location);
        }
        if let Some(is_all_day) = update.is_all_day {
            self.is_all_day = is_all_day;
        }
        if let Some(reminder) = update.reminder_minutes {
            self.reminder_minutes = Some(reminder);
        }
        if let Some(tags) = update.tags {
            self.tags = Some(tags);
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update for an event. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    /// `Some(None)` clears the end time.
    pub end_time: Option<Option<DateTime<Utc>>>,
    pub location: Option<String>,
    pub is_all_day: Option<bool>,
    pub reminder_minutes: Option<i64>,
    pub tags: Option<Vec<String>>,
}

impl EventUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Filters for listing events by start time (inclusive bounds).
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub start_after: Option<DateTime<Utc>>,
    pub start_before: Option<DateTime<Utc>>,
}
