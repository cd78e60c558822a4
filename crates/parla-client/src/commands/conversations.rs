//! Conversation list, the open thread lifecycle and group membership.

use chrono::Utc;
use parla_shared::protocol::{InboundEvent, OutboundEvent};
use parla_shared::{ConversationId, ReceiptState, UserId};
use parla_store::{
    Contact, Conversation, LastOpened, LoadReport, Member, MembershipChange, MembershipOutcome,
    Message,
};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::commands::presence;
use crate::contacts::digits;
use crate::dispatcher;
use crate::error::{ClientError, Result};
use crate::events::ClientEvent;
use crate::receipts;
use crate::socket_bridge::run_effects;
use crate::state::{Client, ClientState};

/// Reload conversations and contacts from the backend in parallel.
pub async fn load_all(client: &Client) -> Result<LoadReport> {
    let backend = client.backend();
    let me = client.local_user().clone();
    let (conversations, contacts) =
        tokio::try_join!(backend.list_conversations(&me), backend.list_contacts())?;

    let report = client.with_state(|state| {
        let hidden = state.db.hidden_conversations();
        let order = state.db.chat_order();
        let report = state.conversations.replace_all(conversations, &hidden, &order);
        state.contacts.replace(contacts.into_iter().map(Contact::from));
        refresh_open_header(state);
        report
    })?;

    info!(
        loaded = report.loaded,
        hidden = report.hidden,
        malformed = report.malformed,
        foreign = report.foreign,
        "Conversations loaded"
    );
    client.emit(ClientEvent::ConversationsChanged);
    Ok(report)
}

/// Rebuild the open thread's header; 1:1 chats show the peer's presence.
pub(crate) fn refresh_open_header(state: &mut ClientState) {
    if state.open_record().is_none() {
        return;
    }
    state.with_thread(|thread, ctx| thread.refresh_header(ctx));

    let me = state.local_user().clone();
    let Some(peer) = state
        .open_record()
        .filter(|c| !c.is_group)
        .and_then(|c| c.counterpart(&me))
        .map(|m| m.id.clone())
    else {
        return;
    };
    let offset = state.config.display_offset;
    let label = state.contacts.presence_label(&peer, Utc::now(), &offset);
    state.thread.set_presence_subtitle(label);
}

/// Open `id`: load its history, report receipts and start the receipt poll.
pub async fn open_conversation(client: &Client, id: &ConversationId) -> Result<()> {
    let (previous, peer) = client.with_state(|state| begin_open(state, id))??;

    let socket = client.socket();
    if let Some(previous) = previous.filter(|p| p != id) {
        if let Err(e) = socket.emit(OutboundEvent::Unsubscribe {
            conversation_id: previous,
        }) {
            warn!(error = %e, "Failed to leave previous room");
        }
    }
    if let Err(e) = socket.emit(OutboundEvent::Subscribe {
        conversation_id: id.clone(),
    }) {
        warn!(error = %e, "Failed to join conversation room");
    }
    client.emit(ClientEvent::ConversationsChanged);
    client.emit(ClientEvent::ThreadChanged {
        conversation_id: id.clone(),
    });

    let payloads = match client.backend().list_messages(id).await {
        Ok(payloads) => payloads,
        Err(e) => {
            warn!(conversation = %id.short(), error = %e, "Failed to load history");
            client.with_state(|state| {
                if state.is_open(id) {
                    state.thread.close();
                    state.scope.reset(None);
                }
            })?;
            client.toast(&e);
            return Err(e);
        }
    };

    let me = client.local_user().clone();
    let inbound = client.with_state(|state| {
        if !state.is_open(id) {
            debug!(conversation = %id.short(), "Conversation changed while loading");
            return None;
        }
        let record = state.conversations.get(id).cloned()?;
        let history: Vec<Message> = payloads
            .into_iter()
            .filter_map(|p| Message::from_payload(p, Some(id)))
            .collect();
        for message in &history {
            state.cache.insert(message.clone());
        }
        state.with_thread(|thread, ctx| thread.activate(&record, &history, ctx));
        refresh_open_header(state);
        Some(
            history
                .iter()
                .filter(|m| m.sender_id.is_some() && !m.is_from(&me))
                .filter_map(|m| m.id.clone())
                .collect::<Vec<_>>(),
        )
    })?;
    let Some(inbound) = inbound else {
        return Ok(());
    };

    let backend = client.backend();
    let conversation = id.clone();
    tokio::spawn(async move {
        for message in &inbound {
            if let Err(e) = backend
                .set_receipt(message, &me, ReceiptState::Delivered)
                .await
            {
                debug!(message = %message.short(), error = %e, "Failed to mark delivered");
            }
        }
        if let Err(e) = backend.mark_read(&conversation).await {
            warn!(conversation = %conversation.short(), error = %e, "Failed to mark read");
        }
    });

    spawn_receipt_poll(client, id)?;
    if let Some(peer) = peer {
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = presence::seed_presence(&client, &peer).await {
                debug!(error = %e, "Presence seed failed");
            }
        });
    }

    client.emit(ClientEvent::ThreadChanged {
        conversation_id: id.clone(),
    });
    info!(conversation = %id.short(), "Conversation opened");
    Ok(())
}

/// Switch the thread to `id` under the lock. Returns the conversation that
/// was open before and, for 1:1 chats, the peer.
fn begin_open(
    state: &mut ClientState,
    id: &ConversationId,
) -> Result<(Option<ConversationId>, Option<UserId>)> {
    let record = state
        .conversations
        .get(id)
        .cloned()
        .ok_or_else(|| ClientError::Validation("That conversation is no longer available".into()))?;
    let me = state.local_user().clone();
    let peer = (!record.is_group)
        .then(|| record.counterpart(&me).map(|m| m.id.clone()))
        .flatten();

    let previous = state.thread.open(id.clone());
    state.scope.reset(Some(id.clone()));
    state.conversations.clear_unread(id);

    let last = LastOpened {
        conversation_id: id.clone(),
        title: Some(state.contacts.conversation_title(&record)),
        other_user_id: peer.clone(),
    };
    if let Err(e) = state.db.set_last_opened(&last) {
        warn!(error = %e, "Failed to remember last conversation");
    }
    Ok((previous, peer))
}

fn spawn_receipt_poll(client: &Client, id: &ConversationId) -> Result<()> {
    let task_client = client.clone();
    let target = id.clone();
    let period = client.config().receipt_poll;
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = reconcile_receipts(&task_client, &target).await {
                debug!(conversation = %target.short(), error = %e, "Receipt poll failed");
            }
        }
    });
    client.with_state(|state| state.scope.attach(id, task))?;
    Ok(())
}

/// One reconciliation pass. Returns how many ticks were upgraded.
pub async fn reconcile_receipts(client: &Client, id: &ConversationId) -> Result<usize> {
    if !client.with_state(|state| state.is_open(id))? {
        return Ok(0);
    }
    let snapshot = client.backend().conversation_receipts(id).await?;
    let me = client.local_user().clone();
    let upgraded = client.with_state(|state| {
        if state.is_open(id) {
            receipts::reconcile(&mut state.thread, &me, &snapshot)
        } else {
            0
        }
    })?;
    if upgraded > 0 {
        client.emit(ClientEvent::ThreadChanged {
            conversation_id: id.clone(),
        });
    }
    Ok(upgraded)
}

/// Close the open thread and stop everything bound to it.
pub fn close_conversation(client: &Client) -> Result<Option<ConversationId>> {
    let closed = client.with_state(|state| {
        let closed = state.thread.close();
        state.scope.reset(None);
        if let Err(e) = state.db.clear_last_opened() {
            warn!(error = %e, "Failed to clear last conversation");
        }
        closed
    })?;
    if let Some(id) = &closed {
        if let Err(e) = client.socket().emit(OutboundEvent::Unsubscribe {
            conversation_id: id.clone(),
        }) {
            warn!(error = %e, "Failed to leave conversation room");
        }
        client.emit(ClientEvent::ThreadChanged {
            conversation_id: id.clone(),
        });
    }
    Ok(closed)
}

/// Reopen the conversation that was open when the client last ran.
pub async fn restore_last_opened(client: &Client) -> Result<bool> {
    let last = client.with_state(|state| {
        let last = state.db.last_opened()?;
        if state.conversations.contains(&last.conversation_id) {
            return Some(last.conversation_id);
        }
        if let Err(e) = state.db.clear_last_opened() {
            warn!(error = %e, "Failed to clear stale last conversation");
        }
        None
    })?;
    match last {
        Some(id) => {
            open_conversation(client, &id).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Hide `id` on this client for good, then ask the backend to delete it.
/// The chat stays hidden even if the backend call fails.
pub async fn hide_conversation(client: &Client, id: &ConversationId) -> Result<()> {
    let was_open = client.with_state(|state| -> Result<bool> {
        let was_open = state.is_open(id);
        if was_open {
            state.thread.close();
            state.scope.reset(None);
        }
        if state
            .db
            .last_opened()
            .is_some_and(|last| &last.conversation_id == id)
        {
            state.db.clear_last_opened()?;
        }
        state.conversations.hide(id, &state.db)?;
        Ok(was_open)
    })??;

    if was_open {
        if let Err(e) = client.socket().emit(OutboundEvent::Unsubscribe {
            conversation_id: id.clone(),
        }) {
            warn!(error = %e, "Failed to leave conversation room");
        }
        client.emit(ClientEvent::ThreadChanged {
            conversation_id: id.clone(),
        });
    }
    client.emit(ClientEvent::ConversationsChanged);
    info!(conversation = %id.short(), "Conversation hidden");

    if let Err(e) = client.backend().delete_conversation(id).await {
        warn!(conversation = %id.short(), error = %e, "Backend delete failed, chat stays hidden");
        client.emit(ClientEvent::Toast {
            message: "Could not delete the chat on the server, but it will no longer appear in your list"
                .to_string(),
        });
    }
    Ok(())
}

/// Create a group with the local user and `members`, then open it.
pub async fn create_group(
    client: &Client,
    title: &str,
    members: &[UserId],
) -> Result<ConversationId> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ClientError::Validation("Enter a group name".into()));
    }
    let me = client.local_user().clone();
    let mut everyone = vec![me.clone()];
    for member in members {
        if !everyone.contains(member) {
            everyone.push(member.clone());
        }
    }
    if everyone.len() < 2 {
        return Err(ClientError::Validation("Select at least one member".into()));
    }

    let payload = match client
        .backend()
        .create_conversation(true, &everyone, Some(title))
        .await
    {
        Ok(payload) => payload,
        Err(e) => {
            client.toast(&e);
            return Err(e);
        }
    };
    let created = Conversation::from_payload(payload).ok_or_else(|| ClientError::Validation("Unexpected server response".into()))?;
    let id = created.id.clone();
    info!(conversation = %id.short(), members = everyone.len(), "Group created");

    adopt(client, created).await;
    open_conversation(client, &id).await?;
    Ok(id)
}

/// Reload the list, keeping `created` even if the listing lags behind.
async fn adopt(client: &Client, created: Conversation) {
    if let Err(e) = load_all(client).await {
        warn!(error = %e, "Reload after create failed");
    }
    let inserted = client
        .with_state(|state| {
            if state.conversations.contains(&created.id) {
                return false;
            }
            state.conversations.upsert(created);
            true
        })
        .unwrap_or(false);
    if inserted {
        client.emit(ClientEvent::ConversationsChanged);
    }
}

/// Existing 1:1 chat with the owner of `phone`, matching by contact id or
/// by the digits of the member's phone.
fn find_direct(state: &ClientState, phone: &str) -> Option<ConversationId> {
    let wanted = digits(phone);
    let contact = state.contacts.by_phone(phone).map(|c| c.contact_id.clone());
    let me = state.local_user();
    state
        .conversations
        .list()
        .iter()
        .filter(|c| !c.is_group && c.members.len() == 2)
        .find(|c| {
            c.counterpart(me).is_some_and(|m| {
                contact.as_ref() == Some(&m.id)
                    || m.phone.as_deref().is_some_and(|p| !wanted.is_empty() && digits(p) == wanted)
            })
        })
        .map(|c| c.id.clone())
}

/// Open the 1:1 chat with the contact owning `phone`, creating it first if
/// it does not exist yet.
pub async fn open_or_create_direct(client: &Client, phone: &str) -> Result<ConversationId> {
    if phone.trim().is_empty() {
        return Err(ClientError::Validation("Enter a phone number".into()));
    }
    let (existing, contact) = client.with_state(|state| {
        (
            find_direct(state, phone),
            state.contacts.by_phone(phone).map(|c| c.contact_id.clone()),
        )
    })?;
    if let Some(id) = existing {
        open_conversation(client, &id).await?;
        return Ok(id);
    }
    let Some(contact) = contact else {
        return Err(ClientError::Validation(
            "Add this number to your contacts first".into(),
        ));
    };

    let me = client.local_user().clone();
    let created = match client
        .backend()
        .create_conversation(false, &[me, contact], None)
        .await
    {
        Ok(payload) => Conversation::from_payload(payload),
        Err(ClientError::Status { status: 409, .. }) => {
            debug!("Direct chat already exists on the server");
            None
        }
        Err(e) => {
            client.toast(&e);
            return Err(e);
        }
    };

    match created {
        Some(created) => adopt(client, created).await,
        None => {
            load_all(client).await?;
        }
    }
    let id = client
        .with_state(|state| find_direct(state, phone))?
        .ok_or_else(|| ClientError::Validation("Could not open the chat".into()))?;
    info!(conversation = %id.short(), "Direct chat ready");
    open_conversation(client, &id).await?;
    Ok(id)
}

/// Add contacts to a group the local user belongs to.
pub async fn add_members(client: &Client, id: &ConversationId, users: &[UserId]) -> Result<usize> {
    let fresh = client.with_state(|state| -> Result<Vec<UserId>> {
        let conversation = state
            .conversations
            .get(id)
            .ok_or(ClientError::NoOpenConversation)?;
        if !conversation.is_group {
            return Err(ClientError::Validation("Members can only be added to groups".into()));
        }
        if !conversation.am_i_member {
            return Err(ClientError::Locked);
        }
        Ok(users
            .iter()
            .filter(|u| !conversation.has_member(u))
            .cloned()
            .collect())
    })??;
    if fresh.is_empty() {
        return Err(ClientError::Validation(
            "Those contacts are already in the group".into(),
        ));
    }

    if let Err(e) = client.backend().add_members(id, &fresh).await {
        client.emit(ClientEvent::Toast {
            message: "Could not add the member to the group".into(),
        });
        return Err(e);
    }

    let added = client.with_state(|state| {
        let mut added = 0;
        for user in &fresh {
            let contact = state.contacts.get(user).cloned();
            let member = Member {
                id: user.clone(),
                alias: contact.as_ref().and_then(|c| c.alias.clone().or_else(|| c.phone.clone())),
                name: contact.as_ref().and_then(|c| c.alias.clone()),
                phone: contact.and_then(|c| c.phone),
                active: true,
                is_admin: false,
            };
            if state
                .conversations
                .apply_membership_delta(id, MembershipChange::Added(member))
                == MembershipOutcome::Changed
            {
                added += 1;
            }
        }
        if state.is_open(id) {
            state.with_thread(|thread, ctx| thread.refresh_header(ctx));
        }
        added
    })?;

    info!(conversation = %id.short(), added, "Members added");
    client.emit(ClientEvent::ConversationsChanged);
    client.emit(ClientEvent::Toast {
        message: "Member added".into(),
    });
    if client.with_state(|state| state.is_open(id))? {
        client.emit(ClientEvent::ThreadChanged {
            conversation_id: id.clone(),
        });
    }
    Ok(added)
}

pub async fn add_member(client: &Client, id: &ConversationId, user: &UserId) -> Result<()> {
    add_members(client, id, std::slice::from_ref(user)).await.map(|_| ())
}

/// Remove `user` from a group. Only the group admin may remove somebody
/// else; any member may remove themselves.
pub async fn remove_member(client: &Client, id: &ConversationId, user: &UserId) -> Result<()> {
    client.with_state(|state| -> Result<()> {
        let me = state.local_user();
        let conversation = state
            .conversations
            .get(id)
            .ok_or(ClientError::NoOpenConversation)?;
        if !conversation.is_group || !conversation.has_member(user) {
            return Err(ClientError::Validation("That person is not in this group".into()));
        }
        if user == me {
            if !conversation.am_i_member {
                return Err(ClientError::Locked);
            }
        } else if !conversation.is_admin(me) {
            return Err(ClientError::Validation(
                "Only the admin can remove members".into(),
            ));
        }
        Ok(())
    })??;

    let leaving = user == client.local_user();
    if let Err(e) = client.backend().remove_member(id, user).await {
        let message = if leaving {
            "Could not leave the group"
        } else {
            "Could not remove the member from the group"
        };
        client.emit(ClientEvent::Toast {
            message: message.into(),
        });
        return Err(e);
    }

    // Same path as the socket echo, which then finds nothing left to change.
    let effects = client.with_state(|state| {
        dispatcher::dispatch(
            state,
            InboundEvent::MemberLeft {
                conversation_id: id.clone(),
                user_id: user.clone(),
                label: None,
            },
        )
    })?;
    run_effects(client, effects);
    info!(conversation = %id.short(), user = %user.short(), leaving, "Member removed");
    Ok(())
}

/// Leave a group. The conversation stays in the list, locked.
pub async fn leave_group(client: &Client, id: &ConversationId) -> Result<()> {
    let me = client.local_user().clone();
    remove_member(client, id, &me).await
}
