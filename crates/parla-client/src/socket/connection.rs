use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parla_media::{MediaError, SignalChannel};
use parla_shared::constants::SOCKET_IO_PATH;
use parla_shared::protocol::OutboundEvent;
use parla_shared::ConversationId;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::packet::{self, Packet, SocketPacket};
use crate::error::{ClientError, Result};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Commands sent into the socket task.
#[derive(Debug)]
pub enum SocketCommand {
    Emit(OutboundEvent),
    Shutdown,
}

/// Notifications sent from the socket task to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketNotification {
    /// The Socket.IO namespace is connected; register and resubscribe now.
    Connected,
    Disconnected,
    Event { name: String, data: Value },
}

/// Cloneable sender side of the socket task.
#[derive(Clone)]
pub struct SocketHandle {
    commands: mpsc::UnboundedSender<SocketCommand>,
    call_routes: Arc<Mutex<HashSet<ConversationId>>>,
}

impl SocketHandle {
    /// A handle whose commands land in the returned receiver instead of a
    /// live connection.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<SocketCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (
            Self {
                commands,
                call_routes: Arc::new(Mutex::new(HashSet::new())),
            },
            rx,
        )
    }

    pub fn emit(&self, event: OutboundEvent) -> Result<()> {
        self.commands
            .send(SocketCommand::Emit(event))
            .map_err(|_| ClientError::Socket("socket task is gone".into()))
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(SocketCommand::Shutdown);
    }

    /// Route RTC signals for `id` to the active call until released.
    pub fn listen_call(&self, id: &ConversationId) {
        if let Ok(mut routes) = self.call_routes.lock() {
            routes.insert(id.clone());
        }
    }

    pub fn routes_call(&self, id: &ConversationId) -> bool {
        self.call_routes
            .lock()
            .map(|routes| routes.contains(id))
            .unwrap_or(false)
    }
}

impl SignalChannel for SocketHandle {
    fn emit(&self, event: OutboundEvent) -> std::result::Result<(), MediaError> {
        SocketHandle::emit(self, event).map_err(|_| MediaError::ChannelClosed)
    }

    fn release_listeners(&self, conversation_id: &ConversationId) -> std::result::Result<(), MediaError> {
        let mut routes = self
            .call_routes
            .lock()
            .map_err(|_| MediaError::Signaling("call routes lock poisoned".into()))?;
        routes.remove(conversation_id);
        debug!(conversation = %conversation_id.short(), "Call listeners released");
        Ok(())
    }
}

/// `ws(s)://host/socket.io/?EIO=4&transport=websocket` for an http(s) origin.
pub fn socket_endpoint(origin: &str) -> String {
    let origin = origin.trim_end_matches('/');
    let ws = if let Some(rest) = origin.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = origin.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        origin.to_string()
    };
    format!("{ws}{SOCKET_IO_PATH}")
}

/// Spawn the socket task. It reconnects with exponential backoff until
/// [`SocketHandle::shutdown`] is called or every handle is dropped.
pub fn spawn_socket(origin: &str) -> (SocketHandle, mpsc::Receiver<SocketNotification>) {
    let (handle, cmd_rx) = SocketHandle::detached();
    let (notif_tx, notif_rx) = mpsc::channel(256);
    let url = socket_endpoint(origin);
    tokio::spawn(run(url, cmd_rx, notif_tx));
    (handle, notif_rx)
}

enum SessionEnd {
    Lost,
    Shutdown,
}

async fn run(
    url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<SocketCommand>,
    notif_tx: mpsc::Sender<SocketNotification>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, response)) => {
                info!(url = %url, status = %response.status(), "Socket connected");
                backoff = INITIAL_BACKOFF;
                match session(ws, &mut cmd_rx, &notif_tx).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Lost => {
                        if notif_tx.send(SocketNotification::Disconnected).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(url = %url, error = %e, "Socket connection failed"),
        }

        debug!(delay_ms = backoff.as_millis() as u64, "Reconnecting after backoff");
        let sleep = tokio::time::sleep(backoff);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(SocketCommand::Emit(event)) => {
                        debug!(event = event.name(), "Dropping emit while disconnected");
                    }
                    Some(SocketCommand::Shutdown) | None => {
                        info!("Socket shutdown requested");
                        return;
                    }
                },
            }
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
    info!("Socket task stopped");
}

async fn session(
    ws: WsStream,
    cmd_rx: &mut mpsc::UnboundedReceiver<SocketCommand>,
    notif_tx: &mpsc::Sender<SocketNotification>,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();
    let mut connected = false;

    loop {
        tokio::select! {
            frame = read.next() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(frame = ?frame, "Socket closed by server");
                        return SessionEnd::Lost;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "Socket read failed");
                        return SessionEnd::Lost;
                    }
                    None => return SessionEnd::Lost,
                };

                let reply = match packet::decode(&text) {
                    Ok(Packet::Open(info)) => {
                        debug!(sid = %info.sid, ping_interval = info.ping_interval, "Engine.IO open");
                        Some(packet::CONNECT.to_string())
                    }
                    Ok(Packet::Ping) => Some(packet::PONG.to_string()),
                    Ok(Packet::Close) | Ok(Packet::Message(SocketPacket::Disconnect)) => {
                        return SessionEnd::Lost;
                    }
                    Ok(Packet::Message(SocketPacket::Connect)) => {
                        connected = true;
                        if notif_tx.send(SocketNotification::Connected).await.is_err() {
                            return SessionEnd::Shutdown;
                        }
                        None
                    }
                    Ok(Packet::Message(SocketPacket::ConnectError(reason))) => {
                        warn!(reason = %reason, "Socket.IO connect rejected");
                        return SessionEnd::Lost;
                    }
                    Ok(Packet::Message(SocketPacket::Event { name, data })) => {
                        if notif_tx.send(SocketNotification::Event { name, data }).await.is_err() {
                            return SessionEnd::Shutdown;
                        }
                        None
                    }
                    Ok(_) => None,
                    Err(e) => {
                        debug!(error = %e, "Dropping undecodable frame");
                        None
                    }
                };

                if let Some(reply) = reply {
                    if let Err(e) = write.send(WsMessage::Text(reply)).await {
                        warn!(error = %e, "Socket write failed");
                        return SessionEnd::Lost;
                    }
                }
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(SocketCommand::Emit(event)) => {
                    if !connected {
                        debug!(event = event.name(), "Dropping emit before namespace connect");
                        continue;
                    }
                    let frame = match event.payload() {
                        Ok(payload) => packet::encode_event(event.name(), &payload),
                        Err(e) => Err(e),
                    };
                    match frame {
                        Ok(frame) => {
                            if let Err(e) = write.send(WsMessage::Text(frame)).await {
                                warn!(event = event.name(), error = %e, "Socket write failed");
                                return SessionEnd::Lost;
                            }
                        }
                        Err(e) => warn!(event = event.name(), error = %e, "Failed to encode event"),
                    }
                }
                Some(SocketCommand::Shutdown) | None => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_switches_scheme() {
        assert_eq!(
            socket_endpoint("https://chat.example.com/"),
            "wss://chat.example.com/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(
            socket_endpoint("http://localhost:8000"),
            "ws://localhost:8000/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn call_routes_are_released() {
        let (handle, _rx) = SocketHandle::detached();
        let id = ConversationId::new("c1");
        handle.listen_call(&id);
        assert!(handle.routes_call(&id));
        SignalChannel::release_listeners(&handle, &id).unwrap();
        assert!(!handle.routes_call(&id));
    }

    #[tokio::test]
    async fn emits_reach_the_task_queue() {
        let (handle, mut rx) = SocketHandle::detached();
        handle
            .emit(OutboundEvent::RegisterUser {
                user_id: "7".into(),
            })
            .unwrap();
        match rx.recv().await {
            Some(SocketCommand::Emit(event)) => assert_eq!(event.name(), "registrar_usuario"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
