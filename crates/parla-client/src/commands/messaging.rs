//! Sending and changing messages in the open conversation.
//!
//! Every change goes to the backend first. Once it is accepted the local
//! copy is updated through the same dispatcher path the socket echo takes,
//! so a late or early echo is a no-op.

use parla_shared::constants::TEXT_NO_MESSAGES;
use parla_shared::protocol::{InboundEvent, MessagePayload, OutboundEvent};
use parla_shared::{ConversationId, DeleteMode, MessageId};
use parla_store::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher;
use crate::error::{ClientError, Result};
use crate::events::ClientEvent;
use crate::socket_bridge::run_effects;
use crate::state::{Client, ClientState};
use crate::thread::ThreadPhase;

/// The open conversation, if it accepts new messages.
pub(crate) fn open_active(state: &ClientState) -> Result<ConversationId> {
    let id = state
        .open_conversation()
        .cloned()
        .ok_or(ClientError::NoOpenConversation)?;
    match state.thread.phase() {
        ThreadPhase::Active => Ok(id),
        ThreadPhase::Locked => Err(ClientError::Locked),
        ThreadPhase::Closed | ThreadPhase::Loading => Err(ClientError::NoOpenConversation),
    }
}

/// Feed a message the backend accepted from us through the dispatcher.
/// A missing sender is filled in with the local user.
pub(crate) fn deliver_own(client: &Client, mut payload: MessagePayload) -> Result<()> {
    if payload.sender().is_none() {
        payload.sender_id = Some(client.local_user().clone());
    }
    let effects =
        client.with_state(|state| dispatcher::dispatch(state, InboundEvent::MessageReceived(payload)))?;
    run_effects(client, effects);
    Ok(())
}

/// Send `body` to the open conversation, replying to the composer's reply
/// target if one is set. Blank input is ignored.
pub async fn send_message(client: &Client, body: &str) -> Result<Option<MessageId>> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(None);
    }

    let (id, reply_to, key) = client.with_state(|state| -> Result<(ConversationId, Option<MessageId>, Uuid)> {
        let id = open_active(state)?;
        state.thread.begin_send()?;
        let reply_to = state.thread.composer().reply_to.clone();
        let key = state.with_thread(|thread, ctx| thread.render_pending(body, reply_to.as_ref(), ctx));
        Ok((id, reply_to, key))
    })??;
    client.emit(ClientEvent::ThreadChanged {
        conversation_id: id.clone(),
    });

    match client
        .backend()
        .send_message(&id, body, reply_to.as_ref())
        .await
    {
        Ok(mut payload) => {
            payload.conversation_id.get_or_insert_with(|| id.clone());
            let message_id = payload.id.clone();
            client.with_state(|state| {
                if !state.is_open(&id) {
                    return;
                }
                if let Some(message) = Message::from_payload(payload.clone(), Some(&id)) {
                    let offset = state.config.display_offset;
                    state.thread.confirm_pending(key, &message, &offset);
                }
                state.thread.end_send();
            })?;
            deliver_own(client, payload)?;
            client.emit(ClientEvent::ThreadChanged {
                conversation_id: id.clone(),
            });
            debug!(conversation = %id.short(), "Message sent");
            Ok(message_id)
        }
        Err(e) => {
            warn!(conversation = %id.short(), error = %e, "Send failed");
            client.with_state(|state| {
                if state.is_open(&id) {
                    state.thread.discard_pending(key);
                    state.thread.end_send();
                }
            })?;
            client.emit(ClientEvent::ThreadChanged {
                conversation_id: id.clone(),
            });
            client.toast(&e);
            Err(e)
        }
    }
}

/// Tell the room the local user is typing.
pub fn notify_typing(client: &Client) -> Result<()> {
    let event = client.with_state(|state| -> Result<OutboundEvent> {
        Ok(OutboundEvent::Typing {
            conversation_id: open_active(state)?,
            user_id: state.local_user().clone(),
            name: state.display_name(),
        })
    })??;
    client.socket().emit(event)
}

/// Choose the message the next send replies to. `None` clears it.
pub fn set_reply_target(client: &Client, message: Option<MessageId>) -> Result<bool> {
    client.with_state(|state| state.thread.set_reply_to(message))
}

/// Choose the own message the composer is editing. `None` clears it.
pub fn set_edit_target(client: &Client, message: Option<MessageId>) -> Result<bool> {
    client.with_state(|state| state.thread.set_editing(message))
}

/// Replace the body of an own message.
pub async fn edit_message(client: &Client, message_id: &MessageId, body: &str) -> Result<()> {
    let body = body.trim();
    if body.is_empty() {
        return Err(ClientError::Validation("A message cannot be empty".into()));
    }
    let conversation_id = client.with_state(|state| -> Result<ConversationId> {
        let id = open_active(state)?;
        let me = state.local_user();
        let own = match state.cache.get(message_id) {
            Some(m) => m.is_from(me) && !m.is_tombstoned(),
            None => state
                .thread
                .node(message_id)
                .is_some_and(|n| n.is_mine && !n.tombstoned),
        };
        if !own {
            return Err(ClientError::Validation(
                "You can only edit your own messages".into(),
            ));
        }
        Ok(id)
    })??;

    let edited = match client.backend().edit_message(message_id, body).await {
        Ok(edited) => edited,
        Err(e) => {
            client.toast(&e);
            return Err(e);
        }
    };

    let effects = client.with_state(|state| {
        state.thread.set_editing(None);
        dispatcher::dispatch(
            state,
            InboundEvent::MessageEdited {
                message_id: message_id.clone(),
                conversation_id: conversation_id.clone(),
                body: edited.body,
                edited_at: edited.edited_at,
            },
        )
    })?;
    run_effects(client, effects);
    info!(message = %message_id.short(), "Message edited");
    Ok(())
}

/// Delete a message for the local user only, or for everyone.
pub async fn delete_message(client: &Client, message_id: &MessageId, mode: DeleteMode) -> Result<()> {
    let conversation_id = client.with_state(|state| {
        state
            .cache
            .get(message_id)
            .map(|m| m.conversation_id.clone())
            .or_else(|| state.open_conversation().cloned())
    })?;
    let Some(conversation_id) = conversation_id else {
        return Err(ClientError::NoOpenConversation);
    };

    if let Err(e) = client.backend().delete_message(message_id, mode).await {
        client.toast(&e);
        return Err(e);
    }

    let me = client.local_user().clone();
    let effects = client.with_state(|state| {
        dispatcher::dispatch(
            state,
            InboundEvent::MessageDeleted {
                message_id: message_id.clone(),
                conversation_id: Some(conversation_id),
                mode,
                user_id: Some(me),
            },
        )
    })?;
    run_effects(client, effects);
    info!(message = %message_id.short(), mode = mode.as_query(), "Message deleted");
    Ok(())
}

/// Delete every message the local user sent in `id`. Returns how many rows
/// left the open thread.
pub async fn mass_delete_mine(client: &Client, id: &ConversationId) -> Result<usize> {
    if let Err(e) = client.backend().delete_my_messages(id).await {
        client.emit(ClientEvent::Toast {
            message: "Could not delete the messages".into(),
        });
        return Err(e);
    }

    let me = client.local_user().clone();
    let (removed, open) = client.with_state(|state| {
        let cached = state.cache.remove_from_sender(id, &me);
        state.conversations.reset_preview(id, TEXT_NO_MESSAGES);
        let open = state.is_open(id);
        let removed = if open { state.thread.mass_delete_mine() } else { cached };
        (removed, open)
    })?;

    info!(conversation = %id.short(), removed, "Own messages deleted");
    client.emit(ClientEvent::ConversationsChanged);
    if open {
        client.emit(ClientEvent::ThreadChanged {
            conversation_id: id.clone(),
        });
    }
    Ok(removed)
}

/// Set the local reaction on a message. Reactions never leave this client.
pub fn react(client: &Client, message_id: &MessageId, emoji: &str) -> Result<bool> {
    let (id, changed) = client.with_state(|state| -> Result<(ConversationId, bool)> {
        let id = open_active(state)?;
        Ok((id, state.thread.apply_reaction(message_id, emoji)))
    })??;
    if changed {
        client.emit(ClientEvent::ThreadChanged { conversation_id: id });
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use parla_shared::constants::{TEXT_DELETED_BY_ME, TEXT_NO_MESSAGES_YET};
    use parla_store::TickState;
    use serde_json::json;

    use super::*;
    use crate::commands::conversations;
    use crate::state::testing::Harness;

    async fn open_d1() -> Harness {
        let h = Harness::new();
        *h.backend.conversations.lock().unwrap() = serde_json::from_value(json!([
            {"id": "d1", "usuarios": [{"id": "me"}, {"id": "bob", "alias": "Bob"}]},
            {"id": "d2", "usuarios": [{"id": "me"}, {"id": "cat"}]},
        ]))
        .unwrap();
        *h.backend.messages.lock().unwrap() = serde_json::from_value(json!([
            {"id": "m1", "conversacion_id": "d1", "remitente_id": "bob", "cuerpo": "hi"},
            {"id": "m2", "conversacion_id": "d1", "remitente_id": "me", "cuerpo": "mine",
             "creado_en": "2025-03-01T09:00:00"},
        ]))
        .unwrap();
        conversations::load_all(&h.client).await.unwrap();
        conversations::open_conversation(&h.client, &"d1".into()).await.unwrap();
        h
    }

    #[tokio::test]
    async fn send_confirms_optimistic_row_and_moves_chat_up() {
        let h = open_d1().await;
        let id = send_message(&h.client, "  hello  ").await.unwrap().unwrap();

        let thread = h.client.thread().unwrap();
        let row = thread.node(&id).unwrap();
        assert_eq!(row.body, "hello");
        assert!(row.local_key.is_none());
        assert_eq!(row.tick, Some(TickState::Sent));
        assert!(!thread.composer().sending && thread.composer().enabled);
        let list = h.client.conversations().unwrap();
        assert_eq!(list[0].last_message_preview, "hello");

        // The socket echo of the same message is ignored.
        let effects = h
            .client
            .with_state(|s| {
                dispatcher::handle_raw(
                    s,
                    "mensaje_nuevo",
                    json!({"id": id.as_str(), "conversacion_id": "d1", "remitente_id": "me", "cuerpo": "hello"}),
                )
            })
            .unwrap();
        assert!(effects.is_empty());
        assert_eq!(h.client.thread().unwrap().nodes().len(), 3);
    }

    #[tokio::test]
    async fn failed_send_removes_row_and_reenables_composer() {
        let mut h = open_d1().await;
        h.backend.fail("send_message");
        assert!(send_message(&h.client, "lost").await.is_err());
        let thread = h.client.thread().unwrap();
        assert!(thread.nodes().iter().all(|n| n.body != "lost"));
        assert!(thread.composer().enabled && !thread.composer().sending);
        assert!(h
            .drain_events()
            .contains(&ClientEvent::Toast { message: "boom".into() }));
    }

    #[tokio::test]
    async fn second_send_is_rejected_while_first_is_running() {
        let h = open_d1().await;
        h.client.with_state(|s| s.thread.begin_send().unwrap()).unwrap();
        let err = send_message(&h.client, "again").await.unwrap_err();
        assert!(matches!(err, ClientError::SendInProgress));
        assert_eq!(send_message(&h.client, "   ").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reply_target_is_sent_and_cleared() {
        let h = open_d1().await;
        assert!(set_reply_target(&h.client, Some("m1".into())).unwrap());
        let id = send_message(&h.client, "re").await.unwrap().unwrap();
        let thread = h.client.thread().unwrap();
        assert_eq!(thread.node(&id).unwrap().reply.as_ref().unwrap().text, "hi");
        assert!(thread.composer().reply_to.is_none());
    }

    #[tokio::test]
    async fn edit_updates_row_and_only_own_messages() {
        let h = open_d1().await;
        set_edit_target(&h.client, Some("m2".into())).unwrap();
        edit_message(&h.client, &"m2".into(), "fixed").await.unwrap();
        let thread = h.client.thread().unwrap();
        let row = thread.node(&"m2".into()).unwrap();
        assert_eq!(row.body, "fixed");
        assert_eq!(row.time_label, "Edited 12:30");
        assert!(thread.composer().editing.is_none());

        let err = edit_message(&h.client, &"m1".into(), "nope").await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        assert!(!h.backend.called("edit_message m1"));
    }

    #[tokio::test]
    async fn delete_modes_apply_locally_after_backend() {
        let h = open_d1().await;
        delete_message(&h.client, &"m2".into(), DeleteMode::ForEveryone)
            .await
            .unwrap();
        assert!(h.backend.called("delete_message m2 para_todos"));
        let thread = h.client.thread().unwrap();
        assert_eq!(thread.node(&"m2".into()).unwrap().body, TEXT_DELETED_BY_ME);

        delete_message(&h.client, &"m1".into(), DeleteMode::ForMe).await.unwrap();
        assert!(h.client.thread().unwrap().node(&"m1".into()).is_none());
    }

    #[tokio::test]
    async fn mass_delete_resets_preview() {
        let h = open_d1().await;
        let removed = mass_delete_mine(&h.client, &"d1".into()).await.unwrap();
        assert_eq!(removed, 1);
        let thread = h.client.thread().unwrap();
        assert!(thread.nodes().iter().all(|n| !n.is_mine));
        let list = h.client.conversations().unwrap();
        let d1 = list.iter().find(|c| c.id.as_str() == "d1").unwrap();
        assert_eq!(d1.last_message_preview, TEXT_NO_MESSAGES);
        assert_ne!(d1.last_message_preview, TEXT_NO_MESSAGES_YET);
    }

    #[tokio::test]
    async fn reactions_are_local_and_blocked_when_locked() {
        let h = open_d1().await;
        assert!(react(&h.client, &"m1".into(), "👍").unwrap());
        assert!(!react(&h.client, &"m1".into(), "👍").unwrap());
        h.client.with_state(|s| s.thread.lock()).unwrap();
        assert!(matches!(
            react(&h.client, &"m1".into(), "🎉").unwrap_err(),
            ClientError::Locked
        ));
        assert!(h.backend.calls().iter().all(|c| !c.contains("👍")));
    }

    #[tokio::test]
    async fn typing_is_emitted_to_the_room() {
        let mut h = open_d1().await;
        h.drain_emits();
        notify_typing(&h.client).unwrap();
        assert_eq!(h.drain_emits(), vec!["typing"]);
    }
}
