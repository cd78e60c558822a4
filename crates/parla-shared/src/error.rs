use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParlaError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Reasons an inbound socket event is dropped at the boundary
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Malformed {event} payload: {reason}")]
    Malformed { event: String, reason: String },

    #[error("{event} payload missing {field}")]
    MissingField { event: String, field: &'static str },
}
