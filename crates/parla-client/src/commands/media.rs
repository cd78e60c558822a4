//! Call commands.
//!
//! Only one call runs at a time. The call task lives in `parla-media`; here
//! it is started with the socket as its signal channel, and its status is
//! forwarded to the UI as [`ClientEvent::CallStatus`] until it ends.

use std::sync::Arc;

use parla_media::{start_call, CallDeps, CallRole, CallSetup, CallTopology};
use parla_shared::constants::FALLBACK_STUN_SERVERS;
use parla_shared::protocol::{CallInvite, IceServer};
use parla_shared::{CallKind, ConversationId};
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::events::{CallStatusPayload, ClientEvent};
use crate::overlay::Overlay;
use crate::state::Client;

/// ICE servers from the backend, or the public STUN list when the backend
/// has none or cannot be reached.
pub async fn ice_servers(client: &Client) -> Vec<IceServer> {
    match client.backend().ice_servers().await {
        Ok(servers) if !servers.is_empty() => servers,
        Ok(_) => {
            debug!("Backend returned no ICE servers, using public STUN");
            fallback_ice_servers()
        }
        Err(e) => {
            warn!(error = %e, "Failed to fetch ICE servers, using public STUN");
            fallback_ice_servers()
        }
    }
}

fn fallback_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: FALLBACK_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
        username: None,
        credential: None,
    }]
}

/// Call the other member of a 1:1 conversation.
pub async fn start_direct_call(client: &Client, id: &ConversationId, kind: CallKind) -> Result<()> {
    let me = client.local_user().clone();
    let peer = client.with_state(|state| -> Result<_> {
        if state.active_call().is_some() {
            return Err(ClientError::CallActive);
        }
        let conversation = state
            .conversations
            .get(id)
            .ok_or(ClientError::NoOpenConversation)?;
        if conversation.is_group {
            return Err(ClientError::Validation(
                "Use a group call for this conversation".into(),
            ));
        }
        conversation
            .counterpart(&me)
            .map(|m| m.id.clone())
            .ok_or_else(|| ClientError::Validation("Nobody to call in this chat".into()))
    })??;
    launch(client, id, CallRole::Caller, CallTopology::Direct { peer }, kind).await
}

/// Join, or start, the call of a group the local user belongs to.
pub async fn join_group_call(client: &Client, id: &ConversationId, kind: CallKind) -> Result<()> {
    client.with_state(|state| -> Result<()> {
        if state.active_call().is_some() {
            return Err(ClientError::CallActive);
        }
        let conversation = state
            .conversations
            .get(id)
            .ok_or(ClientError::NoOpenConversation)?;
        if !conversation.is_group {
            return Err(ClientError::Validation("This chat is not a group".into()));
        }
        if !conversation.am_i_member {
            return Err(ClientError::Locked);
        }
        Ok(())
    })??;
    launch(client, id, CallRole::Caller, CallTopology::Group, kind).await
}

/// Accept the invite shown by [`ClientEvent::IncomingCall`].
pub async fn answer_call(client: &Client, invite: &CallInvite) -> Result<()> {
    if client.with_state(|state| state.active_call().is_some())? {
        return Err(ClientError::CallActive);
    }
    launch(
        client,
        &invite.conversation_id,
        CallRole::Callee,
        CallTopology::Direct {
            peer: invite.from.clone(),
        },
        invite.kind,
    )
    .await
}

/// Dismiss an incoming call. The caller gives up on its no-answer timer.
pub fn decline_call(client: &Client, invite: &CallInvite) -> Result<()> {
    client.with_state(|state| state.overlays.close(&Overlay::IncomingCall))?;
    info!(from = %invite.from.short(), "Incoming call declined");
    Ok(())
}

/// End the running call. Returns false if there was none.
pub fn hang_up(client: &Client) -> Result<bool> {
    client.with_state(|state| match state.active_call() {
        Some(call) => {
            call.hang_up();
            true
        }
        None => false,
    })
}

async fn launch(
    client: &Client,
    id: &ConversationId,
    role: CallRole,
    topology: CallTopology,
    kind: CallKind,
) -> Result<()> {
    let ice = ice_servers(client).await;
    let setup = CallSetup {
        conversation_id: id.clone(),
        local_user: client.local_user().clone(),
        role,
        topology,
        kind,
        ice_servers: ice,
        no_answer_timeout: client.config().call_timeout,
    };
    let deps = CallDeps {
        peers: client.media().peers.clone(),
        devices: client.media().devices.clone(),
        channel: Arc::new(client.socket().clone()),
    };

    let mut status = client.with_state(|state| -> Result<_> {
        // Another call may have started while the ICE list was loading.
        if state.active_call().is_some() {
            return Err(ClientError::CallActive);
        }
        state.overlays.close(&Overlay::IncomingCall);
        state.socket.listen_call(id);
        let handle = start_call(setup, deps);
        let status = handle.subscribe();
        state.call = Some(handle);
        Ok(status)
    })??;
    info!(conversation = %id.short(), ?role, ?kind, "Call launched");

    let task_client = client.clone();
    let conversation_id = id.clone();
    tokio::spawn(async move {
        loop {
            let current = status.borrow_and_update().clone();
            task_client.emit(ClientEvent::CallStatus(CallStatusPayload::new(
                conversation_id.clone(),
                &current,
            )));
            if current.state.is_terminal() || status.changed().await.is_err() {
                break;
            }
        }
        debug!(conversation = %conversation_id.short(), "Call status feed closed");
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::commands::conversations;
    use crate::state::testing::Harness;

    async fn loaded() -> Harness {
        let h = Harness::new();
        *h.backend.conversations.lock().unwrap() = serde_json::from_value(json!([
            {"id": "d1", "usuarios": [{"id": "me"}, {"id": "bob"}]},
            {"id": "g1", "es_grupo": true, "usuarios": [{"id": "me"}, {"id": "bob"}, {"id": "cat"}]},
        ]))
        .unwrap();
        conversations::load_all(&h.client).await.unwrap();
        h
    }

    /// Next terminal call status.
    async fn ended(h: &mut Harness) -> CallStatusPayload {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), h.events.recv())
                .await
                .expect("call status")
                .expect("event channel open");
            if let ClientEvent::CallStatus(status) = event {
                if status.state == "ended" || status.state == "failed" {
                    return status;
                }
            }
        }
    }

    #[tokio::test]
    async fn ice_falls_back_to_public_stun() {
        let h = Harness::new();
        assert_eq!(ice_servers(&h.client).await[0].urls.len(), FALLBACK_STUN_SERVERS.len());
        h.backend.ice.lock().unwrap().push(IceServer {
            urls: vec!["turn:relay".into()],
            username: Some("u".into()),
            credential: Some("p".into()),
        });
        assert_eq!(ice_servers(&h.client).await[0].urls, vec!["turn:relay".to_string()]);
        h.backend.fail("ice_servers");
        assert_eq!(ice_servers(&h.client).await, fallback_ice_servers());
    }

    #[tokio::test]
    async fn denied_media_ends_direct_call_and_releases_routes() {
        let mut h = loaded().await;
        let d1 = ConversationId::new("d1");
        start_direct_call(&h.client, &d1, CallKind::Video).await.unwrap();
        let status = ended(&mut h).await;
        assert_eq!(status.reason.as_deref(), Some("microphone or camera unavailable"));
        assert!(!h.client.socket().routes_call(&d1));
        assert!(h.drain_emits().contains(&"rtc_leave"));
    }

    #[tokio::test]
    async fn answered_call_blocks_a_second_one_until_hang_up() {
        let mut h = loaded().await;
        let invite = CallInvite {
            conversation_id: "d1".into(),
            from: "bob".into(),
            to: "me".into(),
            kind: CallKind::Audio,
            caller_name: None,
        };
        answer_call(&h.client, &invite).await.unwrap();
        assert!(h.client.socket().routes_call(&"d1".into()));

        let err = start_direct_call(&h.client, &"d1".into(), CallKind::Audio)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::CallActive));

        assert!(hang_up(&h.client).unwrap());
        let status = ended(&mut h).await;
        assert_eq!(status.reason.as_deref(), Some("call ended"));
    }

    #[tokio::test]
    async fn call_kind_matches_conversation_type() {
        let h = loaded().await;
        let err = start_direct_call(&h.client, &"g1".into(), CallKind::Audio)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        let err = join_group_call(&h.client, &"d1".into(), CallKind::Audio)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        assert!(!hang_up(&h.client).unwrap());
    }
}
