//! Types shared by every Parla crate: identifiers, the socket event
//! vocabulary and the wire payloads returned by the chat backend.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{ParlaError, ProtocolError};
pub use types::{CallKind, ConversationId, DeleteMode, MessageId, ReceiptState, UserId};
