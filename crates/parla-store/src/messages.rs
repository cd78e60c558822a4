//! Message cache keyed by server id.
//!
//! Holds every message the client has seen so reply previews and list
//! previews can be resolved without a network round trip. Mutations target
//! ids and are no-ops when the id is unknown.

use std::collections::HashMap;

use parla_shared::{ConversationId, MessageId, UserId};

use crate::models::Message;

#[derive(Default)]
pub struct MessageCache {
    by_id: HashMap<MessageId, Message>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Messages without an id are not cached.
    pub fn insert(&mut self, message: Message) -> bool {
        match message.id.clone() {
            Some(id) => {
                self.by_id.insert(id, message);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn edit(&mut self, id: &MessageId, body: &str, edited_at: Option<&str>) -> bool {
        let Some(message) = self.by_id.get_mut(id) else {
            return false;
        };
        if message.is_tombstoned() {
            return false;
        }
        message.body = body.to_string();
        if edited_at.is_some() {
            message.edited_at = edited_at.map(str::to_string);
        }
        true
    }

    /// Mark deleted for everyone, keeping the entry so its position and id
    /// survive. `body` replaces the stored text.
    pub fn tombstone(&mut self, id: &MessageId, deleted_at: &str, body: &str) -> bool {
        let Some(message) = self.by_id.get_mut(id) else {
            return false;
        };
        if message.is_tombstoned() {
            return false;
        }
        message.deleted_at = Some(deleted_at.to_string());
        message.body = body.to_string();
        message.attachment = None;
        message.reply_to_id = None;
        true
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        self.by_id.remove(id)
    }

    /// Drop every cached message of `sender` in `conversation`.
    pub fn remove_from_sender(&mut self, conversation: &ConversationId, sender: &UserId) -> usize {
        let before = self.by_id.len();
        self.by_id
            .retain(|_, m| !(&m.conversation_id == conversation && m.is_from(sender)));
        before - self.by_id.len()
    }

    /// Cached messages of one conversation ordered by creation time.
    pub fn conversation(&self, conversation: &ConversationId) -> Vec<&Message> {
        let mut messages: Vec<&Message> = self
            .by_id
            .values()
            .filter(|m| &m.conversation_id == conversation)
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        messages
    }
}
