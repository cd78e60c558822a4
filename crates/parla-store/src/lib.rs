//! # parla-store
//!
//! Client-owned state for Parla: the conversation list, the message cache
//! and the small set of preferences persisted locally in SQLite.
//!
//! The in-memory stores are plain structs with mutation methods; the
//! `Database` handle wraps a `rusqlite::Connection` holding JSON preference
//! documents.

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod prefs;

mod error;

pub use conversations::{ConversationStore, LoadReport, MembershipChange, MembershipOutcome};
pub use database::Database;
pub use error::{Result, StoreError};
pub use messages::MessageCache;
pub use models::*;
