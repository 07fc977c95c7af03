//! Action cards attached to orchestrated replies.

pub mod model;

pub use model::{ActionCard, CardAction, CardType};
