//! Memos (notes).

pub mod model;

pub use model::{Memo, MemoUpdate};
