use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("WebRTC error: {0}")]
    Rtc(#[from] webrtc::Error),

    #[error("Microphone or camera unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Signaling channel closed")]
    ChannelClosed,

    #[error("Signaling error: {0}")]
    Signaling(String),
}
