/// Application name
pub const APP_NAME: &str = "Parla";

/// Socket.IO handshake path appended to the socket base URL
pub const SOCKET_IO_PATH: &str = "/socket.io/?EIO=4&transport=websocket";

/// Receipt reconciliation interval while a conversation is open
pub const RECEIPT_POLL_SECS: u64 = 4;

/// How long a typing label stays up without a fresh typing event
pub const TYPING_CLEAR_MS: u64 = 1200;

/// Default no-answer timeout for a call that never connects
pub const CALL_TIMEOUT_SECS: u64 = 50;

/// Dedup set is wiped once it grows past this many keys
pub const DEDUP_MAX_KEYS: usize = 3000;

/// Reply previews are cut to this many characters
pub const REPLY_PREVIEW_MAX_CHARS: usize = 120;

/// Group header lists at most this many member names
pub const SUBTITLE_MAX_NAMES: usize = 5;

/// Public STUN servers used when the backend has no ICE list
pub const FALLBACK_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Local storage keys (JSON values)
pub const KEY_HIDDEN_CHATS: &str = "hidden_chats";
pub const KEY_CURRENT_CHAT: &str = "current_chat";
pub const KEY_CHAT_ORDER: &str = "chat_order";
pub const KEY_SESSION: &str = "session";

/// Display sentinels
pub const LABEL_SELF: &str = "You";
pub const LABEL_UNKNOWN: &str = "Unknown";
pub const LABEL_MEMBERS: &str = "Members";
pub const LABEL_MEMBER: &str = "Member";
pub const TEXT_NO_MESSAGES_YET: &str = "No messages yet";
pub const TEXT_NO_MESSAGES: &str = "No messages";
pub const TEXT_DELETED_BY_ME: &str = "You deleted this message";
pub const TEXT_DELETED: &str = "This message was deleted";
pub const TEXT_REPLY_UNKNOWN: &str = "(message)";
pub const TEXT_REPLY_EMPTY: &str = "(no text)";
pub const TEXT_REPLY_FILE: &str = "(file)";
pub const TEXT_LOCKED_BANNER: &str =
    "You are no longer a member of this group. You can delete this chat from the menu.";
