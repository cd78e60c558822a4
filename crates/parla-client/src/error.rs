use parla_media::MediaError;
use parla_shared::ProtocolError;
use parla_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },

    /// Rejected input, caught locally or reported by the server.
    #[error("{0}")]
    Validation(String),

    #[error("No user identity available")]
    NoIdentity,

    #[error("No conversation is open")]
    NoOpenConversation,

    #[error("You are no longer a member of this conversation")]
    Locked,

    #[error("A message is already being sent")]
    SendInProgress,

    #[error("A call is already active")]
    CallActive,

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Client state lock poisoned")]
    LockPoisoned,
}

impl ClientError {
    /// Text for a toast. Transport details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::Http(_) | Self::Socket(_) => "Could not reach the server".to_string(),
            Self::Status { message, .. } | Self::Validation(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
