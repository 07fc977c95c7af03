//! Action cards: structured UI hints attached to an assistant reply after a
//! creation or mutation in the store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What happened, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardType {
    TodoCreated,
    TodoUpdated,
    TodoCompleted,
    EventCreated,
    EventUpdated,
    MemoCreated,
    MemoUpdated,
}

impl CardType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TodoCreated => "todo_created",
            Self::TodoUpdated => "todo_updated",
            Self::TodoCompleted => "todo_completed",
            Self::EventCreated => "event_created",
            Self::EventUpdated => "event_updated",
            Self::MemoCreated => "memo_created",
            Self::MemoUpdated => "memo_updated",
        }
    }
}

impl std::fmt::Display for CardType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CardType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo_created" => Ok(Self::TodoCreated),
            "todo_updated" => Ok(Self::TodoUpdated),
            "todo_completed" => Ok(Self::TodoCompleted),
            "event_created" => Ok(Self::EventCreated),
            "event_updated" => Ok(Self::EventUpdated),
            "memo_created" => Ok(Self::MemoCreated),
            "memo_updated" => Ok(Self::MemoUpdated),
            _ => Err(format!("Unknown card type: {}", s)),
        }
    }
}

/// A button on a card. `action` names the client-side operation and `params`
/// carries what it needs (usually the record id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardAction {
    pub label: String,
    pub action: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl CardAction {
    /// An action targeting a single record by id.
    pub fn for_id(label: impl Into<String>, action: impl Into<String>, id: impl ToString) -> Self {
        let mut params = Map::new();
        params.insert("id".into(), Value::String(id.to_string()));
        Self {
            label: label.into(),
            action: action.into(),
            params,
        }
    }
}

/// Advisory metadata for a client UI. Never required for correctness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCard {
    pub card_type: CardType,
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<CardAction>,
}

impl ActionCard {
    pub fn new(card_type: CardType) -> Self {
        Self {
            card_type,
            payload: Map::new(),
            actions: Vec::new(),
        }
    }

    /// Set the payload from a JSON object. Non-object values are ignored.
    pub fn with_payload(mut self, payload: Value) -> Self {
        if let Value::Object(map) = payload {
            self.payload = map;
        }
        self
    }

    /// Append an action button.
    pub fn with_action(mut self, action: CardAction) -> Self {
        self.actions.push(action);
        self
    }

    /// JSON form stored under `metadata.action_card` on the assistant message.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
