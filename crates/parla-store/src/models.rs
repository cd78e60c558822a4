//! Domain model structs owned by the client.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to a UI layer.

use parla_shared::protocol::{ContactPayload, ConversationPayload, MemberPayload, MessagePayload};
use parla_shared::{ConversationId, MessageId, UserId};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A participant of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub id: UserId,
    /// Alias as the backend resolved it for the local user.
    pub alias: Option<String>,
    /// Profile name of the member.
    pub name: Option<String>,
    pub phone: Option<String>,
    /// False once the member left or was removed but is still listed.
    pub active: bool,
    pub is_admin: bool,
}

impl From<MemberPayload> for Member {
    fn from(p: MemberPayload) -> Self {
        Self {
            id: p.id,
            alias: p.alias,
            name: p.name,
            phone: p.phone,
            active: p.active.unwrap_or(true),
            is_admin: p.is_admin,
        }
    }
}

/// A 1:1 chat or group as shown in the conversation list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub is_group: bool,
    pub title: Option<String>,
    pub members: Vec<Member>,
    /// Group admin. The member whose id matches is the admin.
    pub creator_id: Option<UserId>,
    pub last_message_preview: String,
    /// Raw server timestamp of the last visible message.
    pub last_message_time: Option<String>,
    pub last_message_id: Option<MessageId>,
    pub am_i_member: bool,
    pub is_hidden_locally: bool,
    /// Unread badge count.
    pub unread: u32,
}

impl Conversation {
    /// Build from a backend summary. Returns `None` for entries without an id.
    pub fn from_payload(payload: ConversationPayload) -> Option<Self> {
        let id = payload.id?;
        let creator_id = payload.creator_id;
        let members = payload
            .members
            .into_iter()
            .map(|m| {
                let mut member = Member::from(m);
                if creator_id.as_ref() == Some(&member.id) {
                    member.is_admin = true;
                }
                member
            })
            .collect();
        let mut conversation = Self {
            id,
            is_group: payload.is_group,
            title: payload.title,
            members,
            creator_id,
            last_message_preview: String::new(),
            last_message_time: None,
            last_message_id: None,
            am_i_member: payload.am_i_member.unwrap_or(true),
            is_hidden_locally: false,
            unread: payload.unread,
        };
        match payload.messages.last() {
            Some(last) => {
                conversation.last_message_preview = last.text().to_string();
                conversation.last_message_time = last.timestamp().map(str::to_string);
                conversation.last_message_id = last.id.clone();
            }
            None => {
                conversation.last_message_preview =
                    parla_shared::constants::TEXT_NO_MESSAGES.to_string();
            }
        }
        Some(conversation)
    }

    pub fn member(&self, id: &UserId) -> Option<&Member> {
        self.members.iter().find(|m| &m.id == id)
    }

    pub fn has_member(&self, id: &UserId) -> bool {
        self.member(id).is_some()
    }

    /// The other side of a 1:1 chat.
    pub fn counterpart(&self, me: &UserId) -> Option<&Member> {
        self.members.iter().find(|m| &m.id != me)
    }

    pub fn active_members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.active)
    }

    pub fn is_admin(&self, user: &UserId) -> bool {
        self.creator_id.as_ref() == Some(user)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageKind {
    Normal,
    System,
    File,
}

/// Attachment category, always derived from the file extension.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
    Document,
}

impl AttachmentKind {
    /// Classify by the extension of a file name or URL path.
    pub fn from_file_name(name: &str) -> Self {
        let path = name.split(['?', '#']).next().unwrap_or_default();
        let file = path.rsplit('/').next().unwrap_or_default();
        let ext = file
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" => Self::Image,
            "mp4" | "mov" | "avi" | "mkv" | "webm" => Self::Video,
            "mp3" | "wav" | "ogg" | "m4a" => Self::Audio,
            _ => Self::Document,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    /// Type hint sent by the uploader. Informational only.
    pub kind_hint: Option<String>,
    pub name: String,
    pub size: Option<u64>,
}

impl Attachment {
    pub fn kind(&self) -> AttachmentKind {
        match AttachmentKind::from_file_name(&self.name) {
            AttachmentKind::Document => AttachmentKind::from_file_name(&self.url),
            kind => kind,
        }
    }
}

/// A chat message in the local cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// `None` only for an optimistic message still waiting for its id.
    pub id: Option<MessageId>,
    pub conversation_id: ConversationId,
    /// `None` for system lines.
    pub sender_id: Option<UserId>,
    pub body: String,
    pub created_at: Option<String>,
    pub edited_at: Option<String>,
    /// Set when deleted for everyone.
    pub deleted_at: Option<String>,
    pub reply_to_id: Option<MessageId>,
    pub attachment: Option<Attachment>,
    pub kind: MessageKind,
}

impl Message {
    /// Convert a wire message. `conversation` fills in a missing
    /// conversation id (history endpoints omit it on some deployments).
    pub fn from_payload(payload: MessagePayload, conversation: Option<&ConversationId>) -> Option<Self> {
        let conversation_id = payload
            .conversation_id
            .clone()
            .or_else(|| conversation.cloned())?;
        let attachment = payload.attachment_url.clone().map(|url| Attachment {
            name: payload
                .attachment_name
                .clone()
                .unwrap_or_else(|| url.rsplit('/').next().unwrap_or_default().to_string()),
            url,
            kind_hint: payload.attachment_type.clone(),
            size: payload.attachment_size,
        });
        let kind = match payload.kind.as_deref() {
            Some("sistema") | Some("system") => MessageKind::System,
            Some("archivo") => MessageKind::File,
            _ if attachment.is_some() => MessageKind::File,
            _ => MessageKind::Normal,
        };
        Some(Self {
            id: payload.id.clone(),
            conversation_id,
            sender_id: payload.sender().cloned(),
            body: payload.text().to_string(),
            created_at: payload.timestamp().map(str::to_string),
            edited_at: payload.edited_at,
            deleted_at: payload.deleted_at,
            reply_to_id: payload.reply_to_id,
            attachment,
            kind,
        })
    }

    pub fn is_tombstoned(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_from(&self, user: &UserId) -> bool {
        self.sender_id.as_ref() == Some(user)
    }

    /// Latest meaningful timestamp (edit wins over creation).
    pub fn display_time(&self) -> Option<&str> {
        self.edited_at.as_deref().or(self.created_at.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Contact
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub contact_id: UserId,
    pub alias: Option<String>,
    pub phone: Option<String>,
}

impl From<ContactPayload> for Contact {
    fn from(p: ContactPayload) -> Self {
        Self {
            contact_id: p.contact_id,
            alias: p.alias,
            phone: p.phone,
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery ticks
// ---------------------------------------------------------------------------

/// Outbound tick display, ordered worst to best.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TickState {
    /// Single check
    Sent,
    /// Double check, neutral colour
    Delivered,
    /// Double check, highlighted
    Read,
}

// ---------------------------------------------------------------------------
// Local preferences
// ---------------------------------------------------------------------------

/// Pointer to the conversation that was open last.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastOpened {
    #[serde(rename = "chatId")]
    pub conversation_id: ConversationId,
    #[serde(rename = "otherName", default)]
    pub title: Option<String>,
    #[serde(rename = "otherUserId", default)]
    pub other_user_id: Option<UserId>,
}

/// Mirror of the resolved identity and token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMirror {
    pub user_id: UserId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}
