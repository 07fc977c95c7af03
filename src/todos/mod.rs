//! Todos (tasks).

pub mod model;

pub use model::{TodoFilter, TodoItem, TodoPriority, TodoStatus, TodoUpdate};
