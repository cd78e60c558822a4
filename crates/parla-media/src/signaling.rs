use parla_shared::protocol::{
    CallInvite, IceCandidate, IceEnvelope, OutboundEvent, RtcSignal, SdpEnvelope, SessionDescription,
};
use parla_shared::types::{CallKind, ConversationId, UserId};
use tracing::debug;

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Dialing,
    Negotiating,
    Connected,
    Ended,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }
}

/// Why a call stopped. Every variant is a normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    NoAnswer,
    CouldNotConnect,
    ConnectionLost,
    CallEnded,
    HungUp,
    MediaUnavailable,
    SignalingError,
}

impl EndReason {
    pub fn message(&self) -> &'static str {
        match self {
            Self::NoAnswer => "no answer",
            Self::CouldNotConnect => "could not connect",
            Self::ConnectionLost => "connection lost",
            Self::CallEnded | Self::HungUp => "call ended",
            Self::MediaUnavailable => "microphone or camera unavailable",
            Self::SignalingError => "call could not be set up",
        }
    }

    pub fn final_state(&self) -> CallState {
        match self {
            Self::CouldNotConnect | Self::ConnectionLost | Self::SignalingError => CallState::Failed,
            _ => CallState::Ended,
        }
    }
}

/// Socket side of a call: emit signaling and drop the listeners that were
/// registered for the call's lifetime.
pub trait SignalChannel: Send + Sync {
    fn emit(&self, event: OutboundEvent) -> Result<(), MediaError>;

    fn release_listeners(&self, conversation_id: &ConversationId) -> Result<(), MediaError>;
}

/// What the call should do with an inbound signal addressed to it.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingAction {
    PeerJoined(UserId),
    AnswerOffer {
        from: UserId,
        sdp: SessionDescription,
    },
    ApplyAnswer {
        from: UserId,
        sdp: SessionDescription,
    },
    AddIceCandidate {
        from: UserId,
        candidate: IceCandidate,
    },
    PeerLeft(UserId),
    OfferTo(Vec<UserId>),
}

/// Builds outbound envelopes and filters inbound ones for a single call.
pub struct SignalingSession {
    pub local_user: UserId,
    pub conversation_id: ConversationId,
    pub group: bool,
}

impl SignalingSession {
    pub fn new(local_user: UserId, conversation_id: ConversationId, group: bool) -> Self {
        Self {
            local_user,
            conversation_id,
            group,
        }
    }

    pub fn invite(&self, to: &UserId, kind: CallKind) -> OutboundEvent {
        OutboundEvent::IncomingCall(CallInvite {
            conversation_id: self.conversation_id.clone(),
            from: self.local_user.clone(),
            to: to.clone(),
            kind,
            caller_name: None,
        })
    }

    pub fn join(&self) -> OutboundEvent {
        let (conversation_id, from) = self.route();
        if self.group {
            OutboundEvent::RtcJoinGroup {
                conversation_id,
                from,
            }
        } else {
            OutboundEvent::RtcJoin {
                conversation_id,
                from,
            }
        }
    }

    pub fn caller_ready(&self) -> OutboundEvent {
        let (conversation_id, from) = self.route();
        OutboundEvent::RtcCallerReady {
            conversation_id,
            from,
        }
    }

    pub fn request_participants(&self) -> OutboundEvent {
        let (conversation_id, from) = self.route();
        OutboundEvent::RtcRequestParticipants {
            conversation_id,
            from,
        }
    }

    pub fn offer(&self, to: &UserId, sdp: SessionDescription) -> OutboundEvent {
        debug!(remote = %to.short(), "Sending SDP offer");
        let envelope = self.sdp_envelope(to, sdp);
        if self.group {
            OutboundEvent::RtcOfferGroup(envelope)
        } else {
            OutboundEvent::RtcOffer(envelope)
        }
    }

    pub fn answer(&self, to: &UserId, sdp: SessionDescription) -> OutboundEvent {
        debug!(remote = %to.short(), "Sending SDP answer");
        let envelope = self.sdp_envelope(to, sdp);
        if self.group {
            OutboundEvent::RtcAnswerGroup(envelope)
        } else {
            OutboundEvent::RtcAnswer(envelope)
        }
    }

    pub fn ice_candidate(&self, to: &UserId, candidate: IceCandidate) -> OutboundEvent {
        let envelope = IceEnvelope {
            conversation_id: self.conversation_id.clone(),
            from: self.local_user.clone(),
            to: to.clone(),
            candidate,
        };
        if self.group {
            OutboundEvent::RtcIceCandidateGroup(envelope)
        } else {
            OutboundEvent::RtcIceCandidate(envelope)
        }
    }

    pub fn leave(&self) -> OutboundEvent {
        let (conversation_id, from) = self.route();
        if self.group {
            OutboundEvent::RtcLeaveGroup {
                conversation_id,
                from,
            }
        } else {
            OutboundEvent::RtcLeave {
                conversation_id,
                from,
            }
        }
    }

    /// Map an inbound signal to an action, or `None` if it belongs to
    /// another call, another variant (1:1 vs group) or another recipient.
    pub fn handle_signal(&self, group: bool, signal: RtcSignal) -> Option<SignalingAction> {
        if group != self.group {
            return None;
        }
        let action = match signal {
            RtcSignal::PeerJoined {
                conversation_id,
                user_id,
            } => {
                if conversation_id != self.conversation_id || user_id == self.local_user {
                    return None;
                }
                SignalingAction::PeerJoined(user_id)
            }
            RtcSignal::Offer(env) => {
                self.accepts(&env.conversation_id, &env.to)?;
                debug!(from = %env.from.short(), "Received SDP offer");
                SignalingAction::AnswerOffer {
                    from: env.from,
                    sdp: env.sdp,
                }
            }
            RtcSignal::Answer(env) => {
                self.accepts(&env.conversation_id, &env.to)?;
                debug!(from = %env.from.short(), "Received SDP answer");
                SignalingAction::ApplyAnswer {
                    from: env.from,
                    sdp: env.sdp,
                }
            }
            RtcSignal::IceCandidate(env) => {
                self.accepts(&env.conversation_id, &env.to)?;
                SignalingAction::AddIceCandidate {
                    from: env.from,
                    candidate: env.candidate,
                }
            }
            RtcSignal::PeerLeft {
                conversation_id,
                user_id,
            } => {
                if conversation_id.is_some_and(|c| c != self.conversation_id)
                    || user_id == self.local_user
                {
                    return None;
                }
                debug!(from = %user_id.short(), "Received hangup");
                SignalingAction::PeerLeft(user_id)
            }
            RtcSignal::Participants {
                conversation_id,
                users,
            } => {
                if conversation_id.is_some_and(|c| c != self.conversation_id) {
                    return None;
                }
                let users = users
                    .into_iter()
                    .filter(|u| u != &self.local_user)
                    .collect();
                SignalingAction::OfferTo(users)
            }
        };
        Some(action)
    }

    fn accepts(&self, conversation_id: &ConversationId, to: &UserId) -> Option<()> {
        (conversation_id == &self.conversation_id && to == &self.local_user).then_some(())
    }

    fn route(&self) -> (ConversationId, UserId) {
        (self.conversation_id.clone(), self.local_user.clone())
    }

    fn sdp_envelope(&self, to: &UserId, sdp: SessionDescription) -> SdpEnvelope {
        SdpEnvelope {
            conversation_id: self.conversation_id.clone(),
            from: self.local_user.clone(),
            to: to.clone(),
            sdp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parla_shared::protocol::SdpKind;

    fn session(group: bool) -> SignalingSession {
        SignalingSession::new(UserId::new("me"), ConversationId::new("c"), group)
    }

    fn offer(conv: &str, to: &str) -> RtcSignal {
        RtcSignal::Offer(SdpEnvelope {
            conversation_id: ConversationId::new(conv),
            from: UserId::new("peer"),
            to: UserId::new(to),
            sdp: SessionDescription {
                kind: SdpKind::Offer,
                sdp: "v=0".into(),
            },
        })
    }

    #[test]
    fn signals_for_other_calls_are_ignored() {
        let s = session(false);
        assert!(s.handle_signal(false, offer("other", "me")).is_none());
        assert!(s.handle_signal(false, offer("c", "someone")).is_none());
        assert!(s.handle_signal(true, offer("c", "me")).is_none());
        assert!(matches!(
            s.handle_signal(false, offer("c", "me")),
            Some(SignalingAction::AnswerOffer { .. })
        ));
    }

    #[test]
    fn participants_exclude_self() {
        let s = session(true);
        let action = s.handle_signal(
            true,
            RtcSignal::Participants {
                conversation_id: None,
                users: vec![UserId::new("me"), UserId::new("a")],
            },
        );
        assert_eq!(action, Some(SignalingAction::OfferTo(vec![UserId::new("a")])));
    }

    #[test]
    fn group_envelopes_use_group_events() {
        let s = session(true);
        assert_eq!(s.join().name(), "rtc_join_group");
        assert_eq!(s.leave().name(), "rtc_leave_group");
        let direct = session(false);
        assert_eq!(direct.join().name(), "rtc_join");
        assert_eq!(direct.leave().name(), "rtc_leave");
    }

    #[test]
    fn end_reasons_map_to_states() {
        assert_eq!(EndReason::NoAnswer.final_state(), CallState::Ended);
        assert_eq!(EndReason::CouldNotConnect.final_state(), CallState::Failed);
        assert_eq!(EndReason::CallEnded.message(), "call ended");
        assert_eq!(EndReason::NoAnswer.message(), "no answer");
    }
}
