//! Typed access to the loosely shaped entity map produced by the classifier.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::DatabaseError;

/// Entities extracted by the classifier.
pub type Entities = Map<String, Value>;

/// Formats tried in order by [`parse_datetime`].
const OFFSET_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";
const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Parse a date/time entity. Naive values are taken as UTC; anything that
/// matches none of the known formats is treated as absent.
pub fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, OFFSET_FORMAT) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ndt.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, DATE_FORMAT) {
        return date.and_hms_opt(0, 0, 0).map(|ndt| ndt.and_utc());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    debug!(value = raw, "Ignoring unparseable date entity");
    None
}

/// Non-empty string value at `key`.
pub fn string(entities: &Entities, key: &str) -> Option<String> {
    entities
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Identifier of the record a mutation targets.
///
/// `Ok(None)` when no id was given. An id that is not a valid UUID cannot
/// name any record, so it reports `NotFound` for `entity`.
pub fn target_id(entities: &Entities, entity: &str) -> Result<Option<Uuid>, DatabaseError> {
    let raw = match entities.get("id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Ok(None),
    };
    Uuid::parse_str(&raw)
        .map(Some)
        .map_err(|_| DatabaseError::not_found(entity, raw))
}

/// Tags as a list, accepting either a JSON array or a comma-separated string.
pub fn tags(value: &Value) -> Option<Vec<String>> {
    let tags: Vec<String> = match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => return None,
    };
    Some(tags)
}

/// Fields for an update: `entities.updates` wins over top-level keys.
pub struct UpdateFields<'a> {
    entities: &'a Entities,
    updates: Option<&'a Entities>,
}

impl<'a> UpdateFields<'a> {
    pub fn new(entities: &'a Entities) -> Self {
        let updates = entities.get("updates").and_then(Value::as_object);
        Self { entities, updates }
    }

    /// Raw value for `field`, if present anywhere. `id` is never an update field.
    pub fn get(&self, field: &str) -> Option<&'a Value> {
        if field == "id" {
            return None;
        }
        self.updates
            .and_then(|u| u.get(field))
            .or_else(|| self.entities.get(field))
    }

    pub fn string(&self, field: &str) -> Option<String> {
        self.get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    /// `Some(None)` for an explicit null (clear), `Some(Some(_))` for a
    /// parseable date, `None` when absent or unparseable.
    pub fn datetime(&self, field: &str) -> Option<Option<DateTime<Utc>>> {
        match self.get(field)? {
            Value::Null => Some(None),
            value => parse_datetime(value).map(Some),
        }
    }

    pub fn bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }

    pub fn int(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_i64)
    }

    pub fn tags(&self, field: &str) -> Option<Vec<String>> {
        self.get(field).and_then(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};
    use serde_json::json;

    fn entities(value: Value) -> Entities {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn parses_known_formats() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
        for raw in [
            "2026-03-14T15:09:26+0000",
            "2026-03-14T17:09:26+02:00",
            "2026-03-14T15:09:26Z",
            "2026-03-14T15:09:26",
            "2026-03-14 15:09:26",
        ] {
            assert_eq!(parse_datetime(&json!(raw)), Some(expected), "{raw}");
        }

        let minute = parse_datetime(&json!("2026-03-14 15:09")).unwrap();
        assert_eq!((minute.hour(), minute.minute(), minute.second()), (15, 9, 0));

        let day = parse_datetime(&json!("2026-03-14")).unwrap();
        assert_eq!((day.day(), day.hour()), (14, 0));
    }

    #[test]
    fn unparseable_dates_are_absent() {
        assert_eq!(parse_datetime(&json!("tomorrow 5pm")), None);
        assert_eq!(parse_datetime(&json!("")), None);
        assert_eq!(parse_datetime(&json!(1700000000)), None);
        assert_eq!(parse_datetime(&Value::Null), None);
    }

    #[test]
    fn target_id_distinguishes_missing_from_invalid() {
        assert_eq!(target_id(&entities(json!({})), "Todo").unwrap(), None);
        assert_eq!(target_id(&entities(json!({"id": "  "})), "Todo").unwrap(), None);

        let id = Uuid::new_v4();
        assert_eq!(
            target_id(&entities(json!({"id": id.to_string()})), "Todo").unwrap(),
            Some(id)
        );
        assert!(
            target_id(&entities(json!({"id": "milk"})), "Todo")
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn tags_accept_list_or_csv() {
        assert_eq!(tags(&json!(["a", " b ", ""])), Some(vec!["a".into(), "b".into()]));
        assert_eq!(tags(&json!("home, errands")), Some(vec!["home".into(), "errands".into()]));
        assert_eq!(tags(&json!(3)), None);
    }

    #[test]
    fn nested_updates_take_precedence() {
        let e = entities(json!({
            "id": "x",
            "title": "top",
            "priority": "low",
            "updates": {"title": "nested", "due_date": null}
        }));
        let fields = UpdateFields::new(&e);
        assert_eq!(fields.string("title").as_deref(), Some("nested"));
        assert_eq!(fields.string("priority").as_deref(), Some("low"));
        assert_eq!(fields.datetime("due_date"), Some(None));
        assert!(fields.get("id").is_none());
    }
}
