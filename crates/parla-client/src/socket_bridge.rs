use std::time::Duration;

use parla_shared::constants::TYPING_CLEAR_MS;
use parla_shared::protocol::OutboundEvent;
use parla_shared::ReceiptState;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::commands::conversations;
use crate::dispatcher::{self, Effect};
use crate::events::ClientEvent;
use crate::socket::SocketNotification;
use crate::state::Client;

/// Spawn the loop that feeds socket notifications into the dispatcher.
pub fn start_bridge(client: Client, notif_rx: mpsc::Receiver<SocketNotification>) -> JoinHandle<()> {
    tokio::spawn(notification_loop(client, notif_rx))
}

async fn notification_loop(client: Client, mut notif_rx: mpsc::Receiver<SocketNotification>) {
    info!("Socket notification bridge started");

    while let Some(notification) = notif_rx.recv().await {
        match notification {
            SocketNotification::Connected => on_connected(&client),

            SocketNotification::Disconnected => {
                warn!("Socket disconnected");
                client.emit(ClientEvent::Connection { connected: false });
            }

            SocketNotification::Event { name, data } => {
                debug!(event = %name, "Socket event");
                match client.with_state(|state| dispatcher::handle_raw(state, &name, data)) {
                    Ok(effects) => run_effects(&client, effects),
                    Err(e) => error!(event = %name, error = %e, "Failed to dispatch event"),
                }
            }
        }
    }

    info!("Socket notification bridge stopped");
}

/// Register for presence and rejoin the open conversation's room.
fn on_connected(client: &Client) {
    let open = client
        .with_state(|state| state.open_conversation().cloned())
        .unwrap_or_default();
    let mut events = vec![OutboundEvent::RegisterUser {
        user_id: client.local_user().clone(),
    }];
    if let Some(conversation_id) = open {
        events.push(OutboundEvent::Subscribe { conversation_id });
    }
    for event in events {
        if let Err(e) = client.socket().emit(event) {
            warn!(error = %e, "Failed to queue emit after connect");
        }
    }
    info!(user = %client.local_user().short(), "Registered on socket");
    client.emit(ClientEvent::Connection { connected: true });
}

/// Carry out what the dispatcher asked for.
pub fn run_effects(client: &Client, effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::Notify(event) => client.emit(event),

            Effect::MarkDelivered(message_id) => {
                let backend = client.backend();
                let me = client.local_user().clone();
                tokio::spawn(async move {
                    if let Err(e) = backend
                        .set_receipt(&message_id, &me, ReceiptState::Delivered)
                        .await
                    {
                        warn!(message = %message_id.short(), error = %e, "Failed to mark delivered");
                    }
                });
            }

            Effect::ReloadConversations => {
                let client = client.clone();
                tokio::spawn(async move {
                    if let Err(e) = conversations::load_all(&client).await {
                        warn!(error = %e, "Conversation reload failed");
                    }
                });
            }

            Effect::ScheduleTypingReset {
                conversation_id,
                generation,
            } => {
                let task_client = client.clone();
                let target = conversation_id.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(TYPING_CLEAR_MS)).await;
                    let cleared = task_client
                        .with_state(|state| dispatcher::clear_typing(state, &target, generation))
                        .unwrap_or(false);
                    if cleared {
                        task_client.emit(ClientEvent::ThreadChanged {
                            conversation_id: target,
                        });
                    }
                });
                if let Err(e) = client.with_state(|state| state.scope.attach(&conversation_id, task)) {
                    error!(error = %e, "Failed to register typing timer");
                }
            }
        }
    }
}
