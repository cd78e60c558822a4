use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ProtocolError;
use crate::types::{CallKind, ConversationId, DeleteMode, MessageId, ReceiptState, UserId};

// ---------------------------------------------------------------------------
// Payloads shared by REST responses and socket events
// ---------------------------------------------------------------------------

/// A chat message as the backend serializes it.
///
/// REST and socket producers disagree on a few field names (`remitente_id`
/// vs `usuario_id`, `cuerpo` vs `contenido`, `creado_en` vs `fecha`), so
/// both spellings are kept and read through the accessor methods.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MessagePayload {
    pub id: Option<MessageId>,
    #[serde(rename = "conversacion_id")]
    pub conversation_id: Option<ConversationId>,
    #[serde(rename = "remitente_id", skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(rename = "usuario_id", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(rename = "cuerpo", skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(rename = "contenido", skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(rename = "creado_en", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(rename = "fecha", skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(rename = "editado_en")]
    pub edited_at: Option<String>,
    #[serde(rename = "borrado_en")]
    pub deleted_at: Option<String>,
    #[serde(rename = "mensaje_id_respuesta")]
    pub reply_to_id: Option<MessageId>,
    #[serde(rename = "url_adjunto")]
    pub attachment_url: Option<String>,
    #[serde(rename = "tipo_adjunto")]
    pub attachment_type: Option<String>,
    #[serde(rename = "nombre_archivo")]
    pub attachment_name: Option<String>,
    #[serde(rename = "tamano_adjunto")]
    pub attachment_size: Option<u64>,
    /// `normal`, `sistema`, `archivo` (socket relays also send `mensaje`)
    #[serde(rename = "tipo")]
    pub kind: Option<String>,
}

impl MessagePayload {
    pub fn sender(&self) -> Option<&UserId> {
        self.sender_id.as_ref().or(self.user_id.as_ref())
    }

    pub fn text(&self) -> &str {
        self.body
            .as_deref()
            .or(self.content.as_deref())
            .unwrap_or_default()
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.created_at.as_deref().or(self.date.as_deref())
    }

    /// Key used to drop duplicate deliveries of the same new-message event.
    pub fn dedup_key(&self) -> Option<String> {
        if let Some(id) = &self.id {
            return Some(format!("id_{id}"));
        }
        let conversation = self.conversation_id.as_ref()?;
        Some(format!(
            "ts_{}_{}_{}",
            self.timestamp().unwrap_or_default(),
            self.sender().map(UserId::as_str).unwrap_or_default(),
            conversation
        ))
    }
}

/// Group or 1:1 membership entry inside a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberPayload {
    pub id: UserId,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(rename = "nombre", default)]
    pub name: Option<String>,
    #[serde(rename = "telefono", default)]
    pub phone: Option<String>,
    /// Missing means active
    #[serde(rename = "activo", default)]
    pub active: Option<bool>,
    #[serde(rename = "es_admin", default)]
    pub is_admin: bool,
}

/// A conversation summary from `chats/{user}`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConversationPayload {
    pub id: Option<ConversationId>,
    #[serde(rename = "es_grupo")]
    pub is_group: bool,
    #[serde(rename = "titulo")]
    pub title: Option<String>,
    #[serde(rename = "usuarios")]
    pub members: Vec<MemberPayload>,
    #[serde(rename = "creador_id")]
    pub creator_id: Option<UserId>,
    #[serde(rename = "soy_miembro")]
    pub am_i_member: Option<bool>,
    #[serde(rename = "ocultado_para_mi")]
    pub hidden_for_me: bool,
    #[serde(rename = "mensajes")]
    pub messages: Vec<MessagePayload>,
    #[serde(rename = "no_leidos")]
    pub unread: u32,
}

/// A saved contact of the local user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContactPayload {
    #[serde(rename = "contacto_id")]
    pub contact_id: UserId,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(rename = "telefono", default)]
    pub phone: Option<String>,
}

/// One observer's delivery state for one message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceiptPayload {
    #[serde(rename = "usuario_id")]
    pub user_id: UserId,
    #[serde(rename = "estado")]
    pub state: ReceiptState,
}

/// Body of `PUT mensajes/{id}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EditedMessage {
    #[serde(rename = "cuerpo", default)]
    pub body: String,
    #[serde(rename = "editado_en", default)]
    pub edited_at: Option<String>,
}

/// Presence snapshot (`auth/estado_usuario` or a `usuario_estado` event)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PresencePayload {
    #[serde(rename = "usuario_id")]
    pub user_id: Option<UserId>,
    #[serde(rename = "en_linea", skip_serializing_if = "Option::is_none")]
    pub en_linea: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(rename = "ultima_conexion", skip_serializing_if = "Option::is_none")]
    pub ultima_conexion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
}

impl PresencePayload {
    pub fn is_online(&self) -> bool {
        self.en_linea.or(self.online).unwrap_or(false)
    }

    pub fn last_seen_at(&self) -> Option<&str> {
        self.ultima_conexion.as_deref().or(self.last_seen.as_deref())
    }
}

/// STUN/TURN entry from `webrtc/ice-servers`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

fn one_or_many<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(d)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// Deserialize each element independently, skipping entries that do not
/// match `T`. Returns the parsed items and how many were skipped.
pub fn parse_lenient<T: DeserializeOwned>(values: Vec<Value>) -> (Vec<T>, usize) {
    let total = values.len();
    let parsed: Vec<T> = values
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect();
    let skipped = total - parsed.len();
    (parsed, skipped)
}

// ---------------------------------------------------------------------------
// WebRTC signaling envelopes
// ---------------------------------------------------------------------------

/// Browser-compatible `RTCSessionDescriptionInit`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Browser-compatible `RTCIceCandidateInit`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

/// Offer or answer routed between two call participants
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SdpEnvelope {
    #[serde(rename = "conversacion_id")]
    pub conversation_id: ConversationId,
    pub from: UserId,
    pub to: UserId,
    pub sdp: SessionDescription,
}

/// ICE candidate routed between two call participants
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceEnvelope {
    #[serde(rename = "conversacion_id")]
    pub conversation_id: ConversationId,
    pub from: UserId,
    pub to: UserId,
    pub candidate: IceCandidate,
}

/// Out-of-band ring sent to the callee before any peer connection exists
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallInvite {
    #[serde(rename = "conversacion_id")]
    pub conversation_id: ConversationId,
    pub from: UserId,
    pub to: UserId,
    #[serde(rename = "tipo", default)]
    pub kind: CallKind,
    /// Caller label as resolved by the relay for the callee
    #[serde(rename = "nombre", default, skip_serializing_if = "Option::is_none")]
    pub caller_name: Option<String>,
}

/// Call signaling pushed by the relay. Group variants share the same
/// shapes and are distinguished by [`InboundEvent::Rtc::group`].
#[derive(Debug, Clone, PartialEq)]
pub enum RtcSignal {
    PeerJoined {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    Offer(SdpEnvelope),
    Answer(SdpEnvelope),
    IceCandidate(IceEnvelope),
    PeerLeft {
        conversation_id: Option<ConversationId>,
        user_id: UserId,
    },
    Participants {
        conversation_id: Option<ConversationId>,
        users: Vec<UserId>,
    },
}

// ---------------------------------------------------------------------------
// Server -> client events
// ---------------------------------------------------------------------------

/// Every socket event the client reacts to. Anything else, or any payload
/// missing an identifying field, fails [`InboundEvent::parse`].
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// `mensaje_recibido` / `mensaje_nuevo`; conversation id is guaranteed
    MessageReceived(MessagePayload),
    MessageEdited {
        message_id: MessageId,
        conversation_id: ConversationId,
        body: String,
        edited_at: Option<String>,
    },
    MessageDeleted {
        message_id: MessageId,
        conversation_id: Option<ConversationId>,
        mode: DeleteMode,
        /// User who deleted for themselves (`para_mi` only)
        user_id: Option<UserId>,
    },
    /// `conversacion_creada`, `nuevo_chat` and `grupo_usuario_agregado`:
    /// a conversation the list does not know yet
    ConversationCreated {
        conversation_id: ConversationId,
        title: Option<String>,
    },
    MemberAdded {
        conversation_id: ConversationId,
        user_id: UserId,
        admin_id: Option<UserId>,
        member_label: Option<String>,
        admin_label: Option<String>,
    },
    /// `usuario_salio_grupo`: removal or voluntary exit
    MemberLeft {
        conversation_id: ConversationId,
        user_id: UserId,
        label: Option<String>,
    },
    AdminChanged {
        conversation_id: ConversationId,
        new_admin_id: UserId,
        label: Option<String>,
        at: Option<String>,
    },
    Presence {
        user_id: UserId,
        online: bool,
        last_seen: Option<String>,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        name: Option<String>,
    },
    ReceiptSnapshot {
        message_id: MessageId,
        receipts: Vec<ReceiptPayload>,
    },
    IncomingCall(CallInvite),
    Rtc {
        group: bool,
        signal: RtcSignal,
    },
}

#[derive(Deserialize)]
struct EditedEvent {
    #[serde(rename = "mensaje_id")]
    message_id: MessageId,
    #[serde(rename = "conversacion_id")]
    conversation_id: ConversationId,
    #[serde(rename = "cuerpo", default)]
    body: Option<String>,
    #[serde(rename = "editado_en", default)]
    edited_at: Option<String>,
}

#[derive(Deserialize)]
struct DeletedEvent {
    #[serde(rename = "mensaje_id")]
    message_id: MessageId,
    #[serde(rename = "conversacion_id", default)]
    conversation_id: Option<ConversationId>,
    #[serde(rename = "modo")]
    mode: DeleteMode,
    #[serde(rename = "usuario_id", default)]
    user_id: Option<UserId>,
}

#[derive(Deserialize)]
struct CreatedEvent {
    #[serde(default)]
    conversacion: Option<CreatedInner>,
    #[serde(default)]
    id: Option<ConversationId>,
    #[serde(rename = "conversacion_id", default)]
    conversation_id: Option<ConversationId>,
    #[serde(rename = "titulo", default)]
    title: Option<String>,
}

#[derive(Deserialize)]
struct CreatedInner {
    id: ConversationId,
    #[serde(rename = "titulo", default)]
    title: Option<String>,
}

#[derive(Deserialize)]
struct MemberAddedEvent {
    #[serde(rename = "conversacion_id")]
    conversation_id: ConversationId,
    #[serde(rename = "nuevo_id")]
    user_id: UserId,
    #[serde(default)]
    admin_id: Option<UserId>,
    #[serde(rename = "nuevo_visible", default)]
    member_label: Option<String>,
    #[serde(rename = "admin_visible", default)]
    admin_label: Option<String>,
}

#[derive(Deserialize)]
struct MemberLeftEvent {
    #[serde(rename = "conversacion_id")]
    conversation_id: ConversationId,
    #[serde(rename = "usuario_id")]
    user_id: UserId,
    #[serde(rename = "nombre_salida", default)]
    label: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct UserCard {
    alias: Option<String>,
    #[serde(rename = "nombre")]
    name: Option<String>,
    #[serde(rename = "telefono")]
    phone: Option<String>,
}

#[derive(Deserialize)]
struct AdminChangedEvent {
    #[serde(rename = "conversacion_id")]
    conversation_id: ConversationId,
    #[serde(rename = "nuevo_admin_id")]
    new_admin_id: UserId,
    #[serde(rename = "usuario_data_nuevo", default)]
    card: Option<UserCard>,
    #[serde(rename = "nombre", default)]
    name: Option<String>,
    #[serde(rename = "fecha", default)]
    at: Option<String>,
}

#[derive(Deserialize)]
struct TypingEvent {
    #[serde(rename = "conversacion_id")]
    conversation_id: ConversationId,
    #[serde(rename = "usuario_id")]
    user_id: UserId,
    #[serde(rename = "nombre", default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct ReceiptSnapshotEvent {
    #[serde(rename = "mensaje_id")]
    message_id: MessageId,
    #[serde(rename = "estados")]
    receipts: Vec<ReceiptPayload>,
}

#[derive(Deserialize)]
struct PeerEvent {
    #[serde(rename = "conversacion_id", default)]
    conversation_id: Option<ConversationId>,
    user_id: UserId,
}

#[derive(Deserialize)]
struct ParticipantsEvent {
    #[serde(rename = "conversacion_id", default)]
    conversation_id: Option<ConversationId>,
    #[serde(default)]
    users: Vec<Value>,
}

fn decode<T: DeserializeOwned>(event: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::Malformed {
        event: event.to_string(),
        reason: e.to_string(),
    })
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl InboundEvent {
    /// Validate a raw `(event, data)` pair from the socket.
    pub fn parse(event: &str, data: Value) -> Result<Self, ProtocolError> {
        let parsed = match event {
            "mensaje_recibido" | "mensaje_nuevo" => {
                let msg: MessagePayload = decode(event, data)?;
                if msg.conversation_id.is_none() {
                    return Err(ProtocolError::MissingField {
                        event: event.to_string(),
                        field: "conversacion_id",
                    });
                }
                Self::MessageReceived(msg)
            }
            "mensaje_editado" => {
                let e: EditedEvent = decode(event, data)?;
                Self::MessageEdited {
                    message_id: e.message_id,
                    conversation_id: e.conversation_id,
                    body: e.body.unwrap_or_default(),
                    edited_at: e.edited_at,
                }
            }
            "mensaje_eliminado" => {
                let e: DeletedEvent = decode(event, data)?;
                Self::MessageDeleted {
                    message_id: e.message_id,
                    conversation_id: e.conversation_id,
                    mode: e.mode,
                    user_id: e.user_id,
                }
            }
            "conversacion_creada" | "nuevo_chat" | "grupo_usuario_agregado" => {
                let e: CreatedEvent = decode(event, data)?;
                let (conversation_id, title) = match e.conversacion {
                    Some(inner) => (Some(inner.id), inner.title),
                    None => (e.id.or(e.conversation_id), e.title),
                };
                let conversation_id = conversation_id.ok_or(ProtocolError::MissingField {
                    event: event.to_string(),
                    field: "id",
                })?;
                Self::ConversationCreated {
                    conversation_id,
                    title,
                }
            }
            "miembro_agregado" => {
                let e: MemberAddedEvent = decode(event, data)?;
                Self::MemberAdded {
                    conversation_id: e.conversation_id,
                    user_id: e.user_id,
                    admin_id: e.admin_id,
                    member_label: non_empty(e.member_label),
                    admin_label: non_empty(e.admin_label),
                }
            }
            "usuario_salio_grupo" => {
                let e: MemberLeftEvent = decode(event, data)?;
                Self::MemberLeft {
                    conversation_id: e.conversation_id,
                    user_id: e.user_id,
                    label: non_empty(e.label),
                }
            }
            "admin_cambiado" | "nuevo_admin_grupo" => {
                let e: AdminChangedEvent = decode(event, data)?;
                let label = e
                    .card
                    .and_then(|c| non_empty(c.alias).or(non_empty(c.name)).or(non_empty(c.phone)))
                    .or(non_empty(e.name));
                Self::AdminChanged {
                    conversation_id: e.conversation_id,
                    new_admin_id: e.new_admin_id,
                    label,
                    at: e.at,
                }
            }
            "usuario_estado" => {
                let p: PresencePayload = decode(event, data)?;
                let user_id = p.user_id.clone().ok_or(ProtocolError::MissingField {
                    event: event.to_string(),
                    field: "usuario_id",
                })?;
                Self::Presence {
                    user_id,
                    online: p.is_online(),
                    last_seen: p.last_seen_at().map(str::to_string),
                }
            }
            "typing" => {
                let e: TypingEvent = decode(event, data)?;
                Self::Typing {
                    conversation_id: e.conversation_id,
                    user_id: e.user_id,
                    name: non_empty(e.name),
                }
            }
            "estado_mensaje_inicial" => {
                let e: ReceiptSnapshotEvent = decode(event, data)?;
                Self::ReceiptSnapshot {
                    message_id: e.message_id,
                    receipts: e.receipts,
                }
            }
            "incoming_call" => Self::IncomingCall(decode(event, data)?),
            "rtc_peer_joined" => {
                let e: PeerEvent = decode(event, data)?;
                let conversation_id = e.conversation_id.ok_or(ProtocolError::MissingField {
                    event: event.to_string(),
                    field: "conversacion_id",
                })?;
                Self::Rtc {
                    group: false,
                    signal: RtcSignal::PeerJoined {
                        conversation_id,
                        user_id: e.user_id,
                    },
                }
            }
            "rtc_offer" | "rtc_offer_group" => Self::Rtc {
                group: event.ends_with("_group"),
                signal: RtcSignal::Offer(decode(event, data)?),
            },
            "rtc_answer" | "rtc_answer_group" => Self::Rtc {
                group: event.ends_with("_group"),
                signal: RtcSignal::Answer(decode(event, data)?),
            },
            "rtc_ice_candidate" | "rtc_ice_candidate_group" => Self::Rtc {
                group: event.ends_with("_group"),
                signal: RtcSignal::IceCandidate(decode(event, data)?),
            },
            "rtc_user_left" | "rtc_group_user_left" => {
                let e: PeerEvent = decode(event, data)?;
                Self::Rtc {
                    group: event == "rtc_group_user_left",
                    signal: RtcSignal::PeerLeft {
                        conversation_id: e.conversation_id,
                        user_id: e.user_id,
                    },
                }
            }
            "rtc_group_participants" => {
                let e: ParticipantsEvent = decode(event, data)?;
                let (users, _) = parse_lenient::<UserId>(e.users);
                Self::Rtc {
                    group: true,
                    signal: RtcSignal::Participants {
                        conversation_id: e.conversation_id,
                        users,
                    },
                }
            }
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        };
        Ok(parsed)
    }

    /// Conversation the event belongs to, when it names one.
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::MessageReceived(m) => m.conversation_id.as_ref(),
            Self::MessageEdited {
                conversation_id, ..
            }
            | Self::ConversationCreated {
                conversation_id, ..
            }
            | Self::MemberAdded {
                conversation_id, ..
            }
            | Self::MemberLeft {
                conversation_id, ..
            }
            | Self::AdminChanged {
                conversation_id, ..
            }
            | Self::Typing {
                conversation_id, ..
            } => Some(conversation_id),
            Self::MessageDeleted {
                conversation_id, ..
            } => conversation_id.as_ref(),
            Self::IncomingCall(invite) => Some(&invite.conversation_id),
            Self::Rtc { signal, .. } => match signal {
                RtcSignal::PeerJoined {
                    conversation_id, ..
                } => Some(conversation_id),
                RtcSignal::Offer(e) | RtcSignal::Answer(e) => Some(&e.conversation_id),
                RtcSignal::IceCandidate(e) => Some(&e.conversation_id),
                RtcSignal::PeerLeft {
                    conversation_id, ..
                }
                | RtcSignal::Participants {
                    conversation_id, ..
                } => conversation_id.as_ref(),
            },
            Self::Presence { .. } | Self::ReceiptSnapshot { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Client -> server events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    RegisterUser {
        user_id: UserId,
    },
    Subscribe {
        conversation_id: ConversationId,
    },
    Unsubscribe {
        conversation_id: ConversationId,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        name: String,
    },
    IncomingCall(CallInvite),
    RtcJoin {
        conversation_id: ConversationId,
        from: UserId,
    },
    RtcCallerReady {
        conversation_id: ConversationId,
        from: UserId,
    },
    RtcOffer(SdpEnvelope),
    RtcAnswer(SdpEnvelope),
    RtcIceCandidate(IceEnvelope),
    RtcLeave {
        conversation_id: ConversationId,
        from: UserId,
    },
    RtcJoinGroup {
        conversation_id: ConversationId,
        from: UserId,
    },
    RtcRequestParticipants {
        conversation_id: ConversationId,
        from: UserId,
    },
    RtcOfferGroup(SdpEnvelope),
    RtcAnswerGroup(SdpEnvelope),
    RtcIceCandidateGroup(IceEnvelope),
    RtcLeaveGroup {
        conversation_id: ConversationId,
        from: UserId,
    },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RegisterUser { .. } => "registrar_usuario",
            Self::Subscribe { .. } => "suscribir_conversacion",
            Self::Unsubscribe { .. } => "desuscribir_conversacion",
            Self::Typing { .. } => "typing",
            Self::IncomingCall(_) => "incoming_call",
            Self::RtcJoin { .. } => "rtc_join",
            Self::RtcCallerReady { .. } => "rtc_caller_ready",
            Self::RtcOffer(_) => "rtc_offer",
            Self::RtcAnswer(_) => "rtc_answer",
            Self::RtcIceCandidate(_) => "rtc_ice_candidate",
            Self::RtcLeave { .. } => "rtc_leave",
            Self::RtcJoinGroup { .. } => "rtc_join_group",
            Self::RtcRequestParticipants { .. } => "rtc_group_request_participants",
            Self::RtcOfferGroup(_) => "rtc_offer_group",
            Self::RtcAnswerGroup(_) => "rtc_answer_group",
            Self::RtcIceCandidateGroup(_) => "rtc_ice_candidate_group",
            Self::RtcLeaveGroup { .. } => "rtc_leave_group",
        }
    }

    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        Ok(match self {
            Self::RegisterUser { user_id } => json!({ "usuario_id": user_id }),
            Self::Subscribe { conversation_id } | Self::Unsubscribe { conversation_id } => {
                json!({ "conversacion_id": conversation_id })
            }
            Self::Typing {
                conversation_id,
                user_id,
                name,
            } => json!({
                "conversacion_id": conversation_id,
                "usuario_id": user_id,
                "nombre": name,
            }),
            Self::IncomingCall(invite) => serde_json::to_value(invite)?,
            Self::RtcJoin {
                conversation_id,
                from,
            }
            | Self::RtcCallerReady {
                conversation_id,
                from,
            }
            | Self::RtcLeave {
                conversation_id,
                from,
            }
            | Self::RtcJoinGroup {
                conversation_id,
                from,
            }
            | Self::RtcRequestParticipants {
                conversation_id,
                from,
            }
            | Self::RtcLeaveGroup {
                conversation_id,
                from,
            } => json!({ "conversacion_id": conversation_id, "from": from }),
            Self::RtcOffer(e) | Self::RtcAnswer(e) | Self::RtcOfferGroup(e) | Self::RtcAnswerGroup(e) => {
                serde_json::to_value(e)?
            }
            Self::RtcIceCandidate(e) | Self::RtcIceCandidateGroup(e) => serde_json::to_value(e)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_requires_conversation() {
        let ok = InboundEvent::parse(
            "mensaje_recibido",
            json!({"id": "m1", "conversacion_id": 7, "usuario_id": "u2", "cuerpo": "hola"}),
        )
        .unwrap();
        match ok {
            InboundEvent::MessageReceived(m) => {
                assert_eq!(m.conversation_id, Some(ConversationId::new("7")));
                assert_eq!(m.sender(), Some(&UserId::new("u2")));
                assert_eq!(m.text(), "hola");
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = InboundEvent::parse("mensaje_recibido", json!({"id": "m1", "cuerpo": "x"}));
        assert!(matches!(err, Err(ProtocolError::MissingField { .. })));
    }

    #[test]
    fn dedup_key_prefers_id() {
        let with_id = MessagePayload {
            id: Some(MessageId::new("9")),
            conversation_id: Some(ConversationId::new("c")),
            ..Default::default()
        };
        assert_eq!(with_id.dedup_key().as_deref(), Some("id_9"));

        let without = MessagePayload {
            conversation_id: Some(ConversationId::new("c")),
            user_id: Some(UserId::new("u")),
            created_at: Some("2025-01-01T10:00:00".into()),
            ..Default::default()
        };
        assert_eq!(
            without.dedup_key().as_deref(),
            Some("ts_2025-01-01T10:00:00_u_c")
        );
    }

    #[test]
    fn malformed_events_are_rejected() {
        assert!(InboundEvent::parse("mensaje_editado", json!({"conversacion_id": "c"})).is_err());
        assert!(InboundEvent::parse("mensaje_eliminado", json!({"mensaje_id": "m"})).is_err());
        assert!(InboundEvent::parse("typing", json!({"usuario_id": "u"})).is_err());
        assert!(InboundEvent::parse("usuario_estado", json!({"en_linea": true})).is_err());
        assert!(matches!(
            InboundEvent::parse("something_else", json!({})),
            Err(ProtocolError::UnknownEvent(_))
        ));
    }

    #[test]
    fn created_event_variants_share_a_shape() {
        let a = InboundEvent::parse(
            "conversacion_creada",
            json!({"creador_id": "u1", "conversacion": {"id": "c1", "es_grupo": true, "titulo": "G"}}),
        )
        .unwrap();
        let b = InboundEvent::parse("nuevo_chat", json!({"id": "c1", "titulo": "G"})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn admin_changed_label_prefers_alias() {
        let e = InboundEvent::parse(
            "admin_cambiado",
            json!({
                "conversacion_id": "c",
                "nuevo_admin_id": "u9",
                "usuario_data_nuevo": {"alias": " ", "telefono": "555"}
            }),
        )
        .unwrap();
        match e {
            InboundEvent::AdminChanged { label, .. } => assert_eq!(label.as_deref(), Some("555")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rtc_offer_group_flag() {
        let e = InboundEvent::parse(
            "rtc_offer_group",
            json!({
                "conversacion_id": "c",
                "from": "a",
                "to": "b",
                "sdp": {"type": "offer", "sdp": "v=0"}
            }),
        )
        .unwrap();
        match e {
            InboundEvent::Rtc {
                group,
                signal: RtcSignal::Offer(env),
            } => {
                assert!(group);
                assert_eq!(env.sdp.kind, SdpKind::Offer);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn participants_skip_bad_ids() {
        let e = InboundEvent::parse(
            "rtc_group_participants",
            json!({"users": ["a", "", 3, null]}),
        )
        .unwrap();
        match e {
            InboundEvent::Rtc {
                signal: RtcSignal::Participants { users, .. },
                ..
            } => assert_eq!(users, vec![UserId::new("a"), UserId::new("3")]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn outbound_ice_keeps_browser_field_names() {
        let ev = OutboundEvent::RtcIceCandidate(IceEnvelope {
            conversation_id: ConversationId::new("c"),
            from: UserId::new("a"),
            to: UserId::new("b"),
            candidate: IceCandidate {
                candidate: "candidate:1".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        });
        assert_eq!(ev.name(), "rtc_ice_candidate");
        let v = ev.payload().unwrap();
        assert_eq!(v["conversacion_id"], "c");
        assert_eq!(v["candidate"]["sdpMid"], "0");
        assert_eq!(v["candidate"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn ice_server_urls_accept_string() {
        let s: IceServer = serde_json::from_value(json!({"urls": "stun:x"})).unwrap();
        assert_eq!(s.urls, vec!["stun:x".to_string()]);
    }
}
