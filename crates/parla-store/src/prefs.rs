//! Client-local preferences kept in the `local_state` table.
//!
//! Values are JSON documents under fixed keys. A missing or undecodable
//! value reads as the default; writes replace the whole document.

use std::collections::HashSet;

use chrono::Utc;
use parla_shared::constants::{KEY_CHAT_ORDER, KEY_CURRENT_CHAT, KEY_HIDDEN_CHATS, KEY_SESSION};
use parla_shared::ConversationId;
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::database::Database;
use crate::error::Result;
use crate::models::{LastOpened, SessionMirror};

impl Database {
    /// Read a JSON value. Corrupt entries are logged and treated as absent.
    pub fn read_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw: Option<String> = match self
            .conn()
            .query_row(
                "SELECT value FROM local_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to read local state");
                return None;
            }
        };

        let raw = raw?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding corrupt local state entry");
                None
            }
        }
    }

    pub fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.conn().execute(
            "INSERT INTO local_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, raw, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn remove_key(&self, key: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM local_state WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    // -- hidden conversations ------------------------------------------------

    pub fn hidden_conversations(&self) -> HashSet<ConversationId> {
        self.read_json::<Vec<ConversationId>>(KEY_HIDDEN_CHATS)
            .unwrap_or_default()
            .into_iter()
            .collect()
    }

    /// Add `id` to the hidden list. Returns false if it was already hidden.
    pub fn hide_conversation(&self, id: &ConversationId) -> Result<bool> {
        let mut hidden: Vec<ConversationId> =
            self.read_json(KEY_HIDDEN_CHATS).unwrap_or_default();
        if hidden.contains(id) {
            return Ok(false);
        }
        hidden.push(id.clone());
        self.write_json(KEY_HIDDEN_CHATS, &hidden)?;
        Ok(true)
    }

    // -- last opened conversation -------------------------------------------

    pub fn last_opened(&self) -> Option<LastOpened> {
        self.read_json(KEY_CURRENT_CHAT)
    }

    pub fn set_last_opened(&self, value: &LastOpened) -> Result<()> {
        self.write_json(KEY_CURRENT_CHAT, value)
    }

    pub fn clear_last_opened(&self) -> Result<()> {
        self.remove_key(KEY_CURRENT_CHAT).map(|_| ())
    }

    // -- identity / token mirror --------------------------------------------

    pub fn session_mirror(&self) -> Option<SessionMirror> {
        self.read_json(KEY_SESSION)
    }

    pub fn set_session_mirror(&self, value: &SessionMirror) -> Result<()> {
        self.write_json(KEY_SESSION, value)
    }

    // -- display order hint ---------------------------------------------------

    pub fn chat_order(&self) -> Vec<ConversationId> {
        self.read_json(KEY_CHAT_ORDER).unwrap_or_default()
    }

    pub fn set_chat_order(&self, order: &[ConversationId]) -> Result<()> {
        self.write_json(KEY_CHAT_ORDER, order)
    }
}
