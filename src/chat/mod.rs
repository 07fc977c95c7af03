//! Conversations, streaming turns and their HTTP routes.

pub mod model;
pub mod routes;
pub mod turn;

pub use model::{Conversation, ConversationSummary, StoredMessage};
pub use routes::{AppState, chat_routes};
pub use turn::{ChatService, ChatTurn, TurnEvent, TurnSettings};
