use parla_media::{CallState, CallStatus, EndReason};
use parla_shared::protocol::CallInvite;
use parla_shared::ConversationId;
use serde::Serialize;
use tokio::sync::mpsc;

/// Notifications for the UI layer. The UI re-reads the render model it
/// cares about when one arrives.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    ConversationsChanged,
    ThreadChanged {
        conversation_id: ConversationId,
    },
    UnreadChanged {
        conversation_id: ConversationId,
        unread: u32,
    },
    /// The open conversation was locked after the local user was removed.
    Locked {
        conversation_id: ConversationId,
    },
    Toast {
        message: String,
    },
    IncomingCall {
        invite: CallInvite,
        caller_label: String,
    },
    CallStatus(CallStatusPayload),
    Connection {
        connected: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallStatusPayload {
    pub conversation_id: ConversationId,
    pub state: String,
    pub connected_peers: usize,
    /// User-facing reason once the call is over.
    pub reason: Option<String>,
}

impl CallStatusPayload {
    pub fn new(conversation_id: ConversationId, status: &CallStatus) -> Self {
        let state = match status.state {
            CallState::Idle => "idle",
            CallState::Dialing => "dialing",
            CallState::Negotiating => "negotiating",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
            CallState::Failed => "failed",
        };
        Self {
            conversation_id,
            state: state.to_string(),
            connected_peers: status.connected_peers,
            reason: status.reason.as_ref().map(|r: &EndReason| r.message().to_string()),
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<ClientEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ClientEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

pub fn emit_event(tx: &EventSender, event: ClientEvent) {
    if let Err(e) = tx.send(event) {
        tracing::error!(event = ?e.0, "Failed to emit event, no listener");
    }
}
