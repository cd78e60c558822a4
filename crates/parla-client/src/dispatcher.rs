//! Socket event routing.
//!
//! [`dispatch`] applies one validated [`InboundEvent`] to the client state
//! and returns the [`Effect`]s that need the async runtime (REST calls,
//! timers, UI notifications). It never blocks and never awaits, so it runs
//! under the state lock.

use std::collections::HashSet;

use chrono::Utc;
use parla_shared::constants::{DEDUP_MAX_KEYS, TEXT_NO_MESSAGES};
use parla_shared::protocol::{InboundEvent, MessagePayload, RtcSignal};
use parla_shared::{ConversationId, DeleteMode, MessageId, UserId};
use parla_store::{Member, MembershipChange, MembershipOutcome, Message};
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::contacts::Presence;
use crate::events::ClientEvent;
use crate::receipts;
use crate::render::{list_preview, tombstone_text};
use crate::state::ClientState;

/// Follow-up work produced by an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Report an inbound message as delivered.
    MarkDelivered(MessageId),
    /// The event names a conversation the list does not have yet.
    ReloadConversations,
    Notify(ClientEvent),
    /// Clear the typing label later, if `generation` is still current.
    ScheduleTypingReset {
        conversation_id: ConversationId,
        generation: u64,
    },
}

/// Keys of handled new-message events. Cleared wholesale once it grows past
/// [`DEDUP_MAX_KEYS`]; duplicates only race within a short window.
#[derive(Debug, Default)]
pub struct DedupSet {
    keys: HashSet<String>,
}

impl DedupSet {
    /// Record `key`. Returns `false` if it was already seen.
    pub fn insert(&mut self, key: String) -> bool {
        if self.keys.len() > DEDUP_MAX_KEYS {
            debug!(size = self.keys.len(), "Clearing dedup set");
            self.keys.clear();
        }
        self.keys.insert(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Validate and apply a raw socket event. Malformed events are dropped.
pub fn handle_raw(state: &mut ClientState, name: &str, data: Value) -> Vec<Effect> {
    match InboundEvent::parse(name, data) {
        Ok(event) => dispatch(state, event),
        Err(e) => {
            debug!(event = name, error = %e, "Dropping socket event");
            Vec::new()
        }
    }
}

pub fn dispatch(state: &mut ClientState, event: InboundEvent) -> Vec<Effect> {
    match event {
        InboundEvent::MessageReceived(payload) => on_message(state, payload),
        InboundEvent::MessageEdited {
            message_id,
            conversation_id,
            body,
            edited_at,
        } => on_edit(state, &conversation_id, &message_id, &body, edited_at.as_deref()),
        InboundEvent::MessageDeleted {
            message_id,
            conversation_id,
            mode,
            user_id,
        } => on_delete(state, &message_id, conversation_id, mode, user_id.as_ref()),
        InboundEvent::ConversationCreated {
            conversation_id, ..
        } => {
            if state.conversations.contains(&conversation_id)
                || state.db.hidden_conversations().contains(&conversation_id)
            {
                return Vec::new();
            }
            info!(conversation = %conversation_id.short(), "New conversation announced");
            vec![Effect::ReloadConversations]
        }
        InboundEvent::MemberAdded {
            conversation_id,
            user_id,
            admin_id,
            member_label,
            admin_label,
        } => on_member_added(
            state,
            &conversation_id,
            user_id,
            admin_id.as_ref(),
            member_label,
            admin_label.as_deref(),
        ),
        InboundEvent::MemberLeft {
            conversation_id,
            user_id,
            label,
        } => on_member_left(state, &conversation_id, user_id, label.as_deref()),
        InboundEvent::AdminChanged {
            conversation_id,
            new_admin_id,
            label,
            ..
        } => on_admin_changed(state, &conversation_id, new_admin_id, label.as_deref()),
        InboundEvent::Presence {
            user_id,
            online,
            last_seen,
        } => on_presence(state, user_id, online, last_seen),
        InboundEvent::Typing {
            conversation_id,
            user_id,
            name,
        } => on_typing(state, conversation_id, &user_id, name.as_deref()),
        InboundEvent::ReceiptSnapshot {
            message_id,
            receipts,
        } => {
            let Some(tick) = receipts::aggregate(state.local_user(), &receipts) else {
                return Vec::new();
            };
            match state.thread.conversation_id().cloned() {
                Some(open) if state.thread.set_tick(&message_id, tick) => {
                    vec![thread_changed(open)]
                }
                _ => Vec::new(),
            }
        }
        InboundEvent::IncomingCall(invite) => {
            if &invite.to != state.local_user() {
                return Vec::new();
            }
            if state.active_call().is_some() {
                info!(from = %invite.from.short(), "Ignoring call while another is active");
                return Vec::new();
            }
            let conversation = state.conversations.get(&invite.conversation_id);
            let caller_label =
                state
                    .contacts
                    .resolve_name(&invite.from, conversation, invite.caller_name.as_deref());
            state.overlays.open(crate::overlay::Overlay::IncomingCall);
            info!(from = %invite.from.short(), kind = ?invite.kind, "Incoming call");
            vec![Effect::Notify(ClientEvent::IncomingCall {
                invite,
                caller_label,
            })]
        }
        InboundEvent::Rtc { group, signal } => {
            route_signal(state, group, signal);
            Vec::new()
        }
    }
}

fn thread_changed(conversation_id: ConversationId) -> Effect {
    Effect::Notify(ClientEvent::ThreadChanged { conversation_id })
}

fn on_message(state: &mut ClientState, payload: MessagePayload) -> Vec<Effect> {
    let Some(key) = payload.dedup_key() else {
        return Vec::new();
    };
    if !state.dedup.insert(key) {
        trace!("Duplicate message event");
        return Vec::new();
    }
    let Some(message) = Message::from_payload(payload, None) else {
        return Vec::new();
    };
    let conversation_id = message.conversation_id.clone();
    let Some(conversation) = state.conversations.get(&conversation_id) else {
        debug!(conversation = %conversation_id.short(), "Message for unknown conversation");
        return vec![Effect::ReloadConversations];
    };
    if conversation.is_group && !conversation.am_i_member {
        debug!(conversation = %conversation_id.short(), "Dropping message for a group we left");
        return Vec::new();
    }

    let me = state.local_user().clone();
    let mine = message.is_from(&me);
    state.conversations.update_preview(
        &conversation_id,
        &list_preview(&message, &me),
        message.created_at.as_deref(),
        message.id.as_ref(),
    );
    move_to_top(state, &conversation_id);
    state.cache.insert(message.clone());

    let mut effects = vec![Effect::Notify(ClientEvent::ConversationsChanged)];
    if let (false, Some(id)) = (mine, &message.id) {
        effects.push(Effect::MarkDelivered(id.clone()));
    }
    if state.is_open(&conversation_id) {
        if state.with_thread(|thread, ctx| thread.render(&message, ctx)) {
            effects.push(thread_changed(conversation_id));
        }
    } else if !mine {
        if let Some(unread) = state.conversations.bump_unread(&conversation_id) {
            effects.push(Effect::Notify(ClientEvent::UnreadChanged {
                conversation_id,
                unread,
            }));
        }
    }
    effects
}

fn move_to_top(state: &mut ClientState, id: &ConversationId) {
    if state.conversations.reorder_to_top(id) {
        if let Err(e) = state.conversations.persist_order(&state.db) {
            warn!(error = %e, "Failed to persist chat order");
        }
    }
}

fn on_edit(
    state: &mut ClientState,
    conversation_id: &ConversationId,
    message_id: &MessageId,
    body: &str,
    edited_at: Option<&str>,
) -> Vec<Effect> {
    // Without a server time the edit is labelled with when it arrived.
    let received = Utc::now().to_rfc3339();
    let edited_at = Some(edited_at.filter(|t| !t.trim().is_empty()).unwrap_or(&received));
    state.cache.edit(message_id, body, edited_at);
    let mut effects = Vec::new();
    if state
        .conversations
        .update_preview_if_last(conversation_id, message_id, body)
    {
        move_to_top(state, conversation_id);
        effects.push(Effect::Notify(ClientEvent::ConversationsChanged));
    }
    if state.is_open(conversation_id) {
        let offset = state.config.display_offset;
        if state
            .thread
            .edit_message(message_id, body, edited_at, &offset)
        {
            effects.push(thread_changed(conversation_id.clone()));
        }
    }
    effects
}

fn on_delete(
    state: &mut ClientState,
    message_id: &MessageId,
    conversation_id: Option<ConversationId>,
    mode: DeleteMode,
    target_user: Option<&UserId>,
) -> Vec<Effect> {
    let Some(conversation_id) = conversation_id
        .or_else(|| state.cache.get(message_id).map(|m| m.conversation_id.clone()))
    else {
        return Vec::new();
    };
    let me = state.local_user().clone();
    let mut effects = Vec::new();

    match mode {
        DeleteMode::ForMe => {
            if target_user != Some(&me) {
                return Vec::new();
            }
            state.cache.remove(message_id);
            if state.is_open(&conversation_id)
                && state.thread.delete_for_me(message_id, &me, &me)
            {
                effects.push(thread_changed(conversation_id.clone()));
            }
            if refresh_preview_after_removal(state, &conversation_id, message_id) {
                effects.push(Effect::Notify(ClientEvent::ConversationsChanged));
            }
        }
        DeleteMode::ForEveryone => {
            let is_mine = state
                .cache
                .get(message_id)
                .map(|m| m.is_from(&me))
                .or_else(|| state.thread.node(message_id).map(|n| n.is_mine))
                .unwrap_or(false);
            let notice = tombstone_text(is_mine);
            state
                .cache
                .tombstone(message_id, &Utc::now().to_rfc3339(), notice);
            if state.is_open(&conversation_id) && state.thread.delete_for_everyone(message_id) {
                effects.push(thread_changed(conversation_id.clone()));
            }
            if state
                .conversations
                .update_preview_if_last(&conversation_id, message_id, notice)
            {
                effects.push(Effect::Notify(ClientEvent::ConversationsChanged));
            }
        }
    }
    effects
}

/// After `removed` left the cache, point the preview at the latest message
/// still cached, or the empty state.
fn refresh_preview_after_removal(
    state: &mut ClientState,
    conversation_id: &ConversationId,
    removed: &MessageId,
) -> bool {
    let was_last = state
        .conversations
        .get(conversation_id)
        .is_some_and(|c| c.last_message_id.as_ref() == Some(removed));
    if !was_last {
        return false;
    }
    let me = state.local_user().clone();
    let latest = state
        .cache
        .conversation(conversation_id)
        .last()
        .map(|m| (list_preview(m, &me), m.created_at.clone(), m.id.clone()));
    match latest {
        Some((text, time, id)) => {
            state
                .conversations
                .update_preview(conversation_id, &text, time.as_deref(), id.as_ref())
        }
        None => state
            .conversations
            .reset_preview(conversation_id, TEXT_NO_MESSAGES),
    }
}

/// Display name as seen from inside `conversation_id`.
fn name_in(state: &ClientState, conversation_id: &ConversationId, user: &UserId, fallback: Option<&str>) -> String {
    let conversation = state.conversations.get(conversation_id);
    state.contacts.resolve_name(user, conversation, fallback)
}

/// System line plus header refresh for an open conversation.
fn announce(state: &mut ClientState, conversation_id: &ConversationId, line: String) -> Option<Effect> {
    if !state.is_open(conversation_id) {
        return None;
    }
    state.with_thread(|thread, ctx| {
        thread.append_system(line);
        thread.refresh_header(ctx);
    });
    Some(thread_changed(conversation_id.clone()))
}

fn on_member_added(
    state: &mut ClientState,
    conversation_id: &ConversationId,
    user_id: UserId,
    admin_id: Option<&UserId>,
    member_label: Option<String>,
    admin_label: Option<&str>,
) -> Vec<Effect> {
    let member = Member {
        id: user_id.clone(),
        alias: member_label.clone(),
        name: None,
        phone: None,
        active: true,
        is_admin: false,
    };
    match state
        .conversations
        .apply_membership_delta(conversation_id, MembershipChange::Added(member))
    {
        MembershipOutcome::Unknown if &user_id == state.local_user() => {
            vec![Effect::ReloadConversations]
        }
        MembershipOutcome::Changed => {
            let added = name_in(state, conversation_id, &user_id, member_label.as_deref());
            let line = match admin_id {
                Some(admin) => format!(
                    "{} added {added}",
                    name_in(state, conversation_id, admin, admin_label)
                ),
                None => format!("{added} joined the group"),
            };
            let mut effects = vec![Effect::Notify(ClientEvent::ConversationsChanged)];
            effects.extend(announce(state, conversation_id, line));
            effects
        }
        _ => Vec::new(),
    }
}

fn on_member_left(
    state: &mut ClientState,
    conversation_id: &ConversationId,
    user_id: UserId,
    label: Option<&str>,
) -> Vec<Effect> {
    // Resolve before the member entry, and its alias, is gone.
    let name = name_in(state, conversation_id, &user_id, label);
    match state
        .conversations
        .apply_membership_delta(conversation_id, MembershipChange::Removed(user_id))
    {
        MembershipOutcome::LocalUserRemoved => {
            info!(conversation = %conversation_id.short(), "Removed from group");
            let mut effects = vec![Effect::Notify(ClientEvent::ConversationsChanged)];
            if let Some(effect) = announce(
                state,
                conversation_id,
                "You are no longer a member of this group".to_string(),
            ) {
                state.thread.lock();
                effects.push(effect);
                effects.push(Effect::Notify(ClientEvent::Locked {
                    conversation_id: conversation_id.clone(),
                }));
            }
            effects
        }
        MembershipOutcome::Changed => {
            let mut effects = vec![Effect::Notify(ClientEvent::ConversationsChanged)];
            effects.extend(announce(state, conversation_id, format!("{name} left the group")));
            effects
        }
        _ => Vec::new(),
    }
}

fn on_admin_changed(
    state: &mut ClientState,
    conversation_id: &ConversationId,
    new_admin: UserId,
    label: Option<&str>,
) -> Vec<Effect> {
    let name = name_in(state, conversation_id, &new_admin, label);
    match state
        .conversations
        .apply_membership_delta(conversation_id, MembershipChange::AdminChanged(new_admin))
    {
        MembershipOutcome::Changed => {
            let mut effects = vec![Effect::Notify(ClientEvent::ConversationsChanged)];
            effects.extend(announce(
                state,
                conversation_id,
                format!("{name} is now the group admin"),
            ));
            effects
        }
        _ => Vec::new(),
    }
}

fn on_presence(
    state: &mut ClientState,
    user_id: UserId,
    online: bool,
    last_seen: Option<String>,
) -> Vec<Effect> {
    state.contacts.set_presence(
        user_id.clone(),
        Presence {
            online,
            last_seen,
        },
    );
    state.typing_generation += 1;

    let me = state.local_user().clone();
    let Some(open) = state.open_record() else {
        return Vec::new();
    };
    if open.is_group || open.counterpart(&me).map(|m| &m.id) != Some(&user_id) {
        return Vec::new();
    }
    let open = open.id.clone();
    let offset = state.config.display_offset;
    let label = state.contacts.presence_label(&user_id, Utc::now(), &offset);
    state.thread.set_typing(None);
    state.thread.set_presence_subtitle(label);
    vec![thread_changed(open)]
}

fn on_typing(
    state: &mut ClientState,
    conversation_id: ConversationId,
    user_id: &UserId,
    name: Option<&str>,
) -> Vec<Effect> {
    if user_id == state.local_user() || !state.is_open(&conversation_id) {
        return Vec::new();
    }
    let is_group = state.open_record().is_some_and(|c| c.is_group);
    let label = if is_group {
        format!("{} is typing…", name_in(state, &conversation_id, user_id, name))
    } else {
        "typing…".to_string()
    };
    state.typing_generation += 1;
    state.thread.set_typing(Some(label));
    vec![
        thread_changed(conversation_id.clone()),
        Effect::ScheduleTypingReset {
            conversation_id,
            generation: state.typing_generation,
        },
    ]
}

/// Clear the typing label if nothing superseded the update that set it.
pub fn clear_typing(state: &mut ClientState, conversation_id: &ConversationId, generation: u64) -> bool {
    if !state.is_open(conversation_id) || state.typing_generation != generation {
        return false;
    }
    state.thread.set_typing(None);
    true
}

fn route_signal(state: &mut ClientState, group: bool, signal: RtcSignal) {
    let target = InboundEvent::Rtc {
        group,
        signal: signal.clone(),
    }
    .conversation_id()
    .cloned();
    let routed = target
        .as_ref()
        .map_or(true, |id| state.socket.routes_call(id));
    let Some(call) = state.active_call() else {
        trace!("Signal without an active call");
        return;
    };
    if !routed || target.as_ref().is_some_and(|id| id != call.conversation_id()) {
        trace!("Signal for another call");
        return;
    }
    if !call.signal(group, signal) {
        debug!("Call task is gone, signal dropped");
    }
}
