//! Calendar events.

pub mod model;

pub use model::{EventFilter, EventItem, EventUpdate};
