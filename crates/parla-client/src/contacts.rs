//! Display names and presence.
//!
//! Everything here is a pure lookup over the cached contact list and
//! presence map, so it can run while a row is being rendered.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, FixedOffset, Utc};
use parla_shared::constants::{LABEL_MEMBERS, LABEL_SELF, LABEL_UNKNOWN};
use parla_shared::UserId;
use parla_store::{Contact, Conversation};

use crate::render::last_seen_label;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Presence {
    pub online: bool,
    pub last_seen: Option<String>,
}

pub struct ContactBook {
    local_user: UserId,
    contacts: HashMap<UserId, Contact>,
    presence: HashMap<UserId, Presence>,
}

/// Digits only, so `+34 600-11-22` matches `3460011 22`.
pub fn digits(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}

fn trimmed(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

impl ContactBook {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            contacts: HashMap::new(),
            presence: HashMap::new(),
        }
    }

    pub fn replace(&mut self, contacts: impl IntoIterator<Item = Contact>) {
        self.contacts = contacts
            .into_iter()
            .map(|c| (c.contact_id.clone(), c))
            .collect();
    }

    pub fn upsert(&mut self, contact: Contact) {
        self.contacts.insert(contact.contact_id.clone(), contact);
    }

    pub fn get(&self, id: &UserId) -> Option<&Contact> {
        self.contacts.get(id)
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Contact whose phone has the same digits as `phone`.
    pub fn by_phone(&self, phone: &str) -> Option<&Contact> {
        let wanted = digits(phone);
        if wanted.is_empty() {
            return None;
        }
        self.contacts
            .values()
            .find(|c| c.phone.as_deref().map(digits).as_deref() == Some(wanted.as_str()))
    }

    /// Label for `user`. Never empty.
    ///
    /// Order: self, contact alias, contact phone, the alias or phone the
    /// group embeds for that member, `phone_fallback`, then "Unknown".
    pub fn resolve_name(
        &self,
        user: &UserId,
        group: Option<&Conversation>,
        phone_fallback: Option<&str>,
    ) -> String {
        if user == &self.local_user {
            return LABEL_SELF.to_string();
        }
        if let Some(contact) = self.contacts.get(user) {
            if let Some(alias) = trimmed(contact.alias.as_ref()) {
                return alias.to_string();
            }
            if let Some(phone) = trimmed(contact.phone.as_ref()) {
                return phone.to_string();
            }
        }
        if let Some(member) = group.and_then(|c| c.member(user)) {
            if let Some(label) =
                trimmed(member.alias.as_ref()).or_else(|| trimmed(member.phone.as_ref()))
            {
                return label.to_string();
            }
        }
        phone_fallback
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(LABEL_UNKNOWN)
            .to_string()
    }

    /// Title of a conversation row: group title, or the other member's name.
    pub fn conversation_title(&self, conversation: &Conversation) -> String {
        if conversation.is_group {
            if let Some(title) = trimmed(conversation.title.as_ref()) {
                return title.to_string();
            }
            return self.group_subtitle(conversation, usize::MAX);
        }
        match conversation.counterpart(&self.local_user) {
            Some(other) => self.resolve_name(&other.id, Some(conversation), other.phone.as_deref()),
            None => conversation
                .title
                .clone()
                .unwrap_or_else(|| LABEL_UNKNOWN.to_string()),
        }
    }

    /// Active member names, deduplicated, without unresolvable entries,
    /// limited to `max_names` (at least one) with a trailing ", …".
    pub fn group_subtitle(&self, conversation: &Conversation, max_names: usize) -> String {
        let max_names = max_names.max(1);
        let mut seen = HashSet::new();
        let names: Vec<String> = conversation
            .active_members()
            .map(|m| self.resolve_name(&m.id, Some(conversation), m.phone.as_deref()))
            .filter(|name| !name.is_empty() && name != LABEL_UNKNOWN)
            .filter(|name| seen.insert(name.clone()))
            .collect();

        if names.is_empty() {
            return LABEL_MEMBERS.to_string();
        }
        if names.len() > max_names {
            let mut shown = names[..max_names].join(", ");
            shown.push_str(", …");
            return shown;
        }
        names.join(", ")
    }

    pub fn set_presence(&mut self, user: UserId, presence: Presence) {
        self.presence.insert(user, presence);
    }

    pub fn presence(&self, user: &UserId) -> Option<&Presence> {
        self.presence.get(user)
    }

    /// "online", a last-seen label, or `None` if nothing is known.
    pub fn presence_label(
        &self,
        user: &UserId,
        now: DateTime<Utc>,
        offset: &FixedOffset,
    ) -> Option<String> {
        let presence = self.presence.get(user)?;
        if presence.online {
            return Some("online".to_string());
        }
        presence
            .last_seen
            .as_deref()
            .and_then(|raw| last_seen_label(raw, now, offset))
    }
}
