//! Local capture and remote playback seams.
//!
//! The call controller only needs to acquire tracks, stop them, and detach
//! whatever is playing a remote stream. Platform capture lives behind
//! [`MediaDevices`].

use std::sync::Arc;

use async_trait::async_trait;
use parla_shared::CallKind;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl From<CallKind> for MediaConstraints {
    fn from(kind: CallKind) -> Self {
        Self {
            audio: true,
            video: kind == CallKind::Video,
        }
    }
}

/// A captured local track. `stop` releases the device; disabling a track
/// is not enough to turn the microphone off.
pub trait LocalTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn stop(&self);
    fn is_stopped(&self) -> bool;

    /// RTP track to attach to a peer connection, if this capture has one.
    fn rtp_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        None
    }
}

/// Whatever is rendering or playing a remote participant's stream.
pub trait RemoteSink: Send + Sync {
    fn peer_track_id(&self) -> &str;
    fn detach(&self);
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open the requested devices. Denied permission or a missing device is
    /// reported as [`MediaError::DeviceUnavailable`].
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError>;
}
