//! Persistence layer: libSQL-backed storage for chat history, todos,
//! events and memos.

pub mod libsql_backend;
pub mod migrations;
pub mod search;
pub mod traits;

pub use libsql_backend::{LibSqlBackend, LibSqlSession};
pub use traits::{Database, SearchHit, SearchKind, SessionFactory};
