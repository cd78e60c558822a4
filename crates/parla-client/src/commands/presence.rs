//! Own online state and the initial presence of chat peers.

use parla_shared::UserId;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::commands::conversations::refresh_open_header;
use crate::contacts::Presence;
use crate::error::Result;
use crate::events::ClientEvent;
use crate::state::{Client, ClientState};

pub async fn mark_online(client: &Client) -> Result<()> {
    let me = client.local_user();
    match client.backend().mark_online(me).await {
        Ok(()) => {
            info!(user = %me.short(), "Marked online");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "Failed to mark online");
            Err(e)
        }
    }
}

/// Report the local user offline without waiting for the answer.
pub fn mark_offline_beacon(client: &Client) -> JoinHandle<()> {
    let backend = client.backend();
    let me = client.local_user().clone();
    tokio::spawn(async move {
        match backend.mark_offline(&me).await {
            Ok(()) => debug!("Offline beacon sent"),
            Err(e) => warn!(error = %e, "Offline beacon failed"),
        }
    })
}

/// Fetch the current presence of `user`. The socket keeps it fresh after
/// this; the header is refreshed if `user` is the open chat's peer.
pub async fn seed_presence(client: &Client, user: &UserId) -> Result<()> {
    let before = client.with_state(|state| state.contacts.presence(user).cloned())?;
    let payload = client.backend().user_presence(user).await?;
    let fetched = Presence {
        online: payload.is_online(),
        last_seen: payload.last_seen_at().map(str::to_string),
    };
    let open = client.with_state(|state| {
        if !record_seed(state, user, before.as_ref(), fetched) {
            return None;
        }
        let me = state.local_user().clone();
        let is_peer = state
            .open_record()
            .filter(|c| !c.is_group)
            .and_then(|c| c.counterpart(&me))
            .is_some_and(|m| &m.id == user);
        if !is_peer {
            return None;
        }
        refresh_open_header(state);
        state.open_conversation().cloned()
    })?;
    if let Some(conversation_id) = open {
        client.emit(ClientEvent::ThreadChanged { conversation_id });
    }
    Ok(())
}

/// Store a fetched presence unless a socket update replaced `before` while
/// the request was in flight. Returns whether it was stored.
fn record_seed(
    state: &mut ClientState,
    user: &UserId,
    before: Option<&Presence>,
    fetched: Presence,
) -> bool {
    if state.contacts.presence(user) != before {
        debug!(user = %user.short(), "Presence changed while seeding, keeping the newer value");
        return false;
    }
    state.contacts.set_presence(user.clone(), fetched);
    true
}

#[cfg(test)]
mod tests {
    use parla_shared::protocol::PresencePayload;
    use serde_json::json;

    use super::*;
    use crate::commands::conversations;
    use crate::state::testing::Harness;

    #[tokio::test]
    async fn seeded_presence_updates_open_peer_subtitle() {
        let h = Harness::new();
        *h.backend.conversations.lock().unwrap() = serde_json::from_value(json!([
            {"id": "d1", "usuarios": [{"id": "me"}, {"id": "bob"}]},
        ]))
        .unwrap();
        *h.backend.presence.lock().unwrap() = PresencePayload {
            en_linea: Some(true),
            ..Default::default()
        };
        conversations::load_all(&h.client).await.unwrap();
        conversations::open_conversation(&h.client, &"d1".into()).await.unwrap();

        seed_presence(&h.client, &"bob".into()).await.unwrap();
        let thread = h.client.thread().unwrap();
        assert_eq!(thread.header().subtitle, "online");
    }

    #[tokio::test]
    async fn beacon_runs_in_background() {
        let h = Harness::new();
        mark_offline_beacon(&h.client).await.unwrap();
        assert!(h.backend.called("mark_offline me"));

        h.backend.fail("mark_offline");
        mark_offline_beacon(&h.client).await.unwrap();
    }

    #[tokio::test]
    async fn online_failure_is_reported() {
        let h = Harness::new();
        mark_online(&h.client).await.unwrap();
        h.backend.fail("mark_online");
        assert!(mark_online(&h.client).await.is_err());
    }

    #[tokio::test]
    async fn socket_presence_during_seed_is_kept() {
        let h = Harness::new();
        let bob = UserId::new("bob");
        let fetched = Presence {
            online: true,
            last_seen: None,
        };
        let newer = Presence {
            online: false,
            last_seen: Some("2025-03-01T10:00:00".into()),
        };

        h.client
            .with_state(|s| {
                // Nothing known when the request went out; the socket answered first.
                s.contacts.set_presence(bob.clone(), newer.clone());
                assert!(!record_seed(s, &bob, None, fetched.clone()));
                assert_eq!(s.contacts.presence(&bob), Some(&newer));

                assert!(record_seed(s, &bob, Some(&newer), fetched.clone()));
                assert_eq!(s.contacts.presence(&bob), Some(&fetched));
            })
            .unwrap();
    }
}
