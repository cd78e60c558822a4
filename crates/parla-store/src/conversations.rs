//! In-memory conversation list.
//!
//! The store is rebuilt from the backend on every full reload and patched
//! in place by socket events. Order is the visual order of the list.

use std::collections::HashSet;

use parla_shared::protocol::ConversationPayload;
use parla_shared::{ConversationId, MessageId, UserId};
use tracing::debug;

use crate::database::Database;
use crate::error::Result;
use crate::models::{Conversation, Member};

/// Counters from a full reload, for logging.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub malformed: usize,
    pub hidden: usize,
    pub foreign: usize,
}

/// Incremental membership patch from a socket event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Added(Member),
    Removed(UserId),
    AdminChanged(UserId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipOutcome {
    /// Conversation is not in the list
    Unknown,
    /// Patch was already applied
    Unchanged,
    Changed,
    /// The local user is no longer a member
    LocalUserRemoved,
}

pub struct ConversationStore {
    local_user: UserId,
    items: Vec<Conversation>,
}

impl ConversationStore {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            items: Vec::new(),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Replace the whole list with a fresh backend snapshot.
    ///
    /// Entries without an id, entries hidden locally or by the server, and
    /// 1:1 chats that do not include the local user are skipped. Any
    /// conversation with exactly two members is treated as 1:1. `order_hint`
    /// is the persisted display order: ids it names keep that order, ids it
    /// does not name go first in server order.
    pub fn replace_all(
        &mut self,
        payloads: Vec<ConversationPayload>,
        hidden: &HashSet<ConversationId>,
        order_hint: &[ConversationId],
    ) -> LoadReport {
        let mut report = LoadReport::default();
        let mut fresh = Vec::with_capacity(payloads.len());
        let mut seen = HashSet::new();

        for payload in payloads {
            if payload.hidden_for_me {
                report.hidden += 1;
                continue;
            }
            let Some(mut conversation) = Conversation::from_payload(payload) else {
                report.malformed += 1;
                continue;
            };
            if hidden.contains(&conversation.id) {
                report.hidden += 1;
                continue;
            }
            if !seen.insert(conversation.id.clone()) {
                continue;
            }
            if conversation.members.len() == 2 {
                conversation.is_group = false;
            }
            if !conversation.is_group && !conversation.has_member(&self.local_user) {
                debug!(conversation = %conversation.id, "skipping 1:1 chat without local user");
                report.foreign += 1;
                continue;
            }
            if !conversation.is_group {
                conversation.am_i_member = true;
            }
            fresh.push(conversation);
        }

        let rank = |id: &ConversationId| order_hint.iter().position(|h| h == id);
        // Stable sort: unknown ids (None) first in server order, then hint order.
        fresh.sort_by_key(|c| rank(&c.id).map_or((0, 0), |pos| (1, pos)));

        report.loaded = fresh.len();
        self.items = fresh;
        report
    }

    pub fn list(&self) -> &[Conversation] {
        &self.items
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.items.iter().find(|c| &c.id == id)
    }

    pub fn get_mut(&mut self, id: &ConversationId) -> Option<&mut Conversation> {
        self.items.iter_mut().find(|c| &c.id == id)
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.get(id).is_some()
    }

    /// Current visual order, for persisting as the display-order hint.
    pub fn order(&self) -> Vec<ConversationId> {
        self.items.iter().map(|c| c.id.clone()).collect()
    }

    /// Insert a conversation at the head, or replace it in place.
    pub fn upsert(&mut self, conversation: Conversation) {
        match self.items.iter().position(|c| c.id == conversation.id) {
            Some(pos) => self.items[pos] = conversation,
            None => self.items.insert(0, conversation),
        }
    }

    /// Apply an add/remove/admin patch. Re-applying the same patch is a no-op.
    pub fn apply_membership_delta(
        &mut self,
        id: &ConversationId,
        change: MembershipChange,
    ) -> MembershipOutcome {
        let local_user = self.local_user.clone();
        let Some(conversation) = self.get_mut(id) else {
            return MembershipOutcome::Unknown;
        };

        match change {
            MembershipChange::Added(member) => {
                if conversation.has_member(&member.id) {
                    return MembershipOutcome::Unchanged;
                }
                if member.id == local_user {
                    conversation.am_i_member = true;
                }
                conversation.members.push(member);
                MembershipOutcome::Changed
            }
            MembershipChange::Removed(user) => {
                let before = conversation.members.len();
                conversation.members.retain(|m| m.id != user);
                let removed = conversation.members.len() != before;
                if user == local_user {
                    let was_member = conversation.am_i_member;
                    conversation.am_i_member = false;
                    if removed || was_member {
                        return MembershipOutcome::LocalUserRemoved;
                    }
                    return MembershipOutcome::Unchanged;
                }
                if removed {
                    MembershipOutcome::Changed
                } else {
                    MembershipOutcome::Unchanged
                }
            }
            MembershipChange::AdminChanged(user) => {
                if conversation.creator_id.as_ref() == Some(&user) {
                    return MembershipOutcome::Unchanged;
                }
                conversation.creator_id = Some(user.clone());
                for member in &mut conversation.members {
                    member.is_admin = member.id == user;
                }
                MembershipOutcome::Changed
            }
        }
    }

    /// Hide a conversation for good on this client. The id is persisted
    /// before it leaves the list so the next reload excludes it too.
    pub fn hide(&mut self, id: &ConversationId, db: &Database) -> Result<bool> {
        db.hide_conversation(id)?;
        let before = self.items.len();
        self.items.retain(|c| &c.id != id);
        Ok(self.items.len() != before)
    }

    /// Move `id` to the head, keeping everyone else in their relative order.
    pub fn reorder_to_top(&mut self, id: &ConversationId) -> bool {
        let Some(pos) = self.items.iter().position(|c| &c.id == id) else {
            return false;
        };
        if pos > 0 {
            let conversation = self.items.remove(pos);
            self.items.insert(0, conversation);
        }
        true
    }

    pub fn persist_order(&self, db: &Database) -> Result<()> {
        db.set_chat_order(&self.order())
    }

    /// Update the list preview for a new or edited message.
    pub fn update_preview(
        &mut self,
        id: &ConversationId,
        text: &str,
        time: Option<&str>,
        message_id: Option<&MessageId>,
    ) -> bool {
        let Some(conversation) = self.get_mut(id) else {
            return false;
        };
        conversation.last_message_preview = text.to_string();
        if let Some(time) = time {
            conversation.last_message_time = Some(time.to_string());
        }
        if let Some(message_id) = message_id {
            conversation.last_message_id = Some(message_id.clone());
        }
        true
    }

    /// Replace the preview text only when `message_id` is the last message.
    pub fn update_preview_if_last(
        &mut self,
        id: &ConversationId,
        message_id: &MessageId,
        text: &str,
    ) -> bool {
        match self.get_mut(id) {
            Some(c) if c.last_message_id.as_ref() == Some(message_id) => {
                c.last_message_preview = text.to_string();
                true
            }
            _ => false,
        }
    }

    /// Reset to an empty-state preview.
    pub fn reset_preview(&mut self, id: &ConversationId, text: &str) -> bool {
        let Some(conversation) = self.get_mut(id) else {
            return false;
        };
        conversation.last_message_preview = text.to_string();
        conversation.last_message_time = None;
        conversation.last_message_id = None;
        true
    }

    pub fn bump_unread(&mut self, id: &ConversationId) -> Option<u32> {
        let conversation = self.get_mut(id)?;
        conversation.unread += 1;
        Some(conversation.unread)
    }

    pub fn clear_unread(&mut self, id: &ConversationId) {
        if let Some(conversation) = self.get_mut(id) {
            conversation.unread = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payloads(v: serde_json::Value) -> Vec<ConversationPayload> {
        serde_json::from_value(v).unwrap()
    }

    fn me() -> UserId {
        UserId::new("me")
    }

    fn sample() -> Vec<ConversationPayload> {
        payloads(json!([
            {"id": "a", "es_grupo": false, "usuarios": [{"id": "me"}, {"id": "u1"}],
             "mensajes": [{"id": "m1", "cuerpo": "hey", "creado_en": "2025-01-01T09:00:00"}]},
            {"id": "b", "es_grupo": true, "titulo": "G", "usuarios": [{"id": "me"}, {"id": "u1"}, {"id": "u2"}]},
            {"id": "c", "es_grupo": true, "usuarios": [{"id": "me"}, {"id": "u3"}]},
            {"es_grupo": true},
            {"id": "d", "ocultado_para_mi": true},
            {"id": "e", "es_grupo": false, "usuarios": [{"id": "x"}, {"id": "y"}]}
        ]))
    }

    #[test]
    fn load_filters_and_normalizes() {
        let mut store = ConversationStore::new(me());
        let hidden: HashSet<_> = [ConversationId::new("b")].into_iter().collect();
        let report = store.replace_all(sample(), &hidden, &[]);

        assert_eq!(report.loaded, 2);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.hidden, 2);
        assert_eq!(report.foreign, 1);

        let c = store.get(&ConversationId::new("c")).unwrap();
        assert!(!c.is_group, "two-member conversations are 1:1");
        let a = store.get(&ConversationId::new("a")).unwrap();
        assert_eq!(a.last_message_preview, "hey");
        assert_eq!(a.last_message_id, Some(MessageId::new("m1")));
    }

    #[test]
    fn hidden_never_reappears() {
        let db = Database::open_in_memory().unwrap();
        let mut store = ConversationStore::new(me());
        store.replace_all(sample(), &db.hidden_conversations(), &[]);
        assert!(store.hide(&ConversationId::new("a"), &db).unwrap());

        for _ in 0..2 {
            store.replace_all(sample(), &db.hidden_conversations(), &[]);
            assert!(!store.contains(&ConversationId::new("a")));
        }
    }

    #[test]
    fn order_hint_applies_after_unknown_ids() {
        let mut store = ConversationStore::new(me());
        let hint = vec![ConversationId::new("c"), ConversationId::new("a")];
        store.replace_all(sample(), &HashSet::new(), &hint);
        let ids: Vec<_> = store.order().into_iter().map(|c| c.0).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn reorder_is_stable() {
        let mut store = ConversationStore::new(me());
        store.replace_all(sample(), &HashSet::new(), &[]);
        assert!(store.reorder_to_top(&ConversationId::new("c")));
        let ids: Vec<_> = store.order().into_iter().map(|c| c.0).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert!(!store.reorder_to_top(&ConversationId::new("zz")));
    }

    #[test]
    fn membership_delta_is_idempotent() {
        let mut store = ConversationStore::new(me());
        store.replace_all(sample(), &HashSet::new(), &[]);
        let g = ConversationId::new("b");
        let member = Member {
            id: UserId::new("u9"),
            alias: Some("Nine".into()),
            name: None,
            phone: None,
            active: true,
            is_admin: false,
        };

        assert_eq!(
            store.apply_membership_delta(&g, MembershipChange::Added(member.clone())),
            MembershipOutcome::Changed
        );
        assert_eq!(
            store.apply_membership_delta(&g, MembershipChange::Added(member)),
            MembershipOutcome::Unchanged
        );
        assert_eq!(store.get(&g).unwrap().members.len(), 4);

        assert_eq!(
            store.apply_membership_delta(&g, MembershipChange::Removed(UserId::new("u9"))),
            MembershipOutcome::Changed
        );
        assert_eq!(
            store.apply_membership_delta(&g, MembershipChange::Removed(UserId::new("u9"))),
            MembershipOutcome::Unchanged
        );
    }

    #[test]
    fn removing_local_user_flips_membership() {
        let mut store = ConversationStore::new(me());
        store.replace_all(sample(), &HashSet::new(), &[]);
        let g = ConversationId::new("b");
        assert_eq!(
            store.apply_membership_delta(&g, MembershipChange::Removed(me())),
            MembershipOutcome::LocalUserRemoved
        );
        assert!(!store.get(&g).unwrap().am_i_member);
        assert_eq!(
            store.apply_membership_delta(&g, MembershipChange::Removed(me())),
            MembershipOutcome::Unchanged
        );
    }

    #[test]
    fn admin_change_marks_single_admin() {
        let mut store = ConversationStore::new(me());
        store.replace_all(sample(), &HashSet::new(), &[]);
        let g = ConversationId::new("b");
        store.apply_membership_delta(&g, MembershipChange::AdminChanged(UserId::new("u2")));
        let conv = store.get(&g).unwrap();
        assert!(conv.is_admin(&UserId::new("u2")));
        assert_eq!(conv.members.iter().filter(|m| m.is_admin).count(), 1);
    }

    #[test]
    fn preview_helpers() {
        let mut store = ConversationStore::new(me());
        store.replace_all(sample(), &HashSet::new(), &[]);
        let a = ConversationId::new("a");
        assert!(!store.update_preview_if_last(&a, &MessageId::new("other"), "x"));
        assert!(store.update_preview_if_last(&a, &MessageId::new("m1"), "edited"));
        assert_eq!(store.get(&a).unwrap().last_message_preview, "edited");
        assert_eq!(store.bump_unread(&a), Some(1));
        store.clear_unread(&a);
        assert_eq!(store.get(&a).unwrap().unread, 0);
        store.reset_preview(&a, "No messages");
        assert!(store.get(&a).unwrap().last_message_id.is_none());
    }
}
