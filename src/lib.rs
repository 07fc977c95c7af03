//! ClawChat: conversational productivity server.
//!
//! A chat turn is classified into an intent, dispatched to a handler that
//! acts on todos, events and memos, or streamed from a language model.

pub mod calendar;
pub mod cards;
pub mod chat;
pub mod config;
pub mod error;
pub mod llm;
pub mod memos;
pub mod orchestrator;
pub mod server;
pub mod store;
pub mod todos;
