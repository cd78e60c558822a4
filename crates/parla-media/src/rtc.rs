//! `webrtc`-backed implementations of the call seams.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parla_shared::protocol::{IceCandidate, IceServer, SdpKind, SessionDescription};
use parla_shared::types::UserId;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::devices::{LocalTrack, MediaConstraints, MediaDevices, MediaKind, RemoteSink};
use crate::error::MediaError;
use crate::webrtc_peer::{LinkState, PeerEvent, PeerFactory, PeerLink};

pub struct RtcPeerFactory {
    api: Arc<API>,
}

impl RtcPeerFactory {
    pub fn new() -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api: Arc::new(api) })
    }
}

fn rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
        _ => LinkState::New,
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        peer: &UserId,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>, MediaError> {
        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        let detached = Arc::new(AtomicBool::new(false));

        {
            let peer = peer.clone();
            let events = events.clone();
            let detached = Arc::clone(&detached);
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let peer = peer.clone();
                let events = events.clone();
                let detached = Arc::clone(&detached);
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    if detached.load(Ordering::SeqCst) {
                        return;
                    }
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(PeerEvent::IceCandidate {
                                peer,
                                candidate: IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                    username_fragment: init.username_fragment,
                                },
                            });
                        }
                        Err(e) => warn!(error = %e, "Failed to serialize local ICE candidate"),
                    }
                })
            }));
        }

        {
            let peer = peer.clone();
            let events = events.clone();
            let detached = Arc::clone(&detached);
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let peer = peer.clone();
                let events = events.clone();
                let detached = Arc::clone(&detached);
                Box::pin(async move {
                    if detached.load(Ordering::SeqCst) {
                        return;
                    }
                    let _ = events.send(PeerEvent::StateChanged {
                        peer,
                        state: link_state(state),
                    });
                })
            }));
        }

        {
            let peer = peer.clone();
            let detached = Arc::clone(&detached);
            pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
                let peer = peer.clone();
                let events = events.clone();
                let detached = Arc::clone(&detached);
                Box::pin(async move {
                    if detached.load(Ordering::SeqCst) {
                        return;
                    }
                    debug!(peer = %peer.short(), kind = ?track.kind(), "Remote track arrived");
                    let sink = Arc::new(RtcRemoteSink {
                        track_id: track.id(),
                        track: Mutex::new(Some(track)),
                    });
                    let _ = events.send(PeerEvent::RemoteTrack { peer, sink });
                })
            }));
        }

        Ok(Arc::new(RtcPeerLink { pc, detached }))
    }
}

pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
    detached: Arc<AtomicBool>,
}

fn to_rtc(sdp: SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    Ok(match sdp.kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(sdp.sdp)?,
    })
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn add_local_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), MediaError> {
        let rtp = track
            .rtp_track()
            .ok_or_else(|| MediaError::DeviceUnavailable(format!("track {} has no RTP source", track.id())))?;
        self.pc
            .add_track(rtp as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: offer.sdp,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: answer.sdp,
        })
    }

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), MediaError> {
        self.pc.set_remote_description(to_rtc(sdp)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    fn detach_handlers(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.pc.close().await?;
        Ok(())
    }
}

pub struct RtcRemoteSink {
    track_id: String,
    track: Mutex<Option<Arc<TrackRemote>>>,
}

impl RtcRemoteSink {
    /// The remote track while the sink is attached.
    pub fn track(&self) -> Option<Arc<TrackRemote>> {
        self.track.lock().ok().and_then(|t| t.clone())
    }
}

impl RemoteSink for RtcRemoteSink {
    fn peer_track_id(&self) -> &str {
        &self.track_id
    }

    fn detach(&self) {
        if let Ok(mut track) = self.track.lock() {
            track.take();
        }
    }
}

/// Sample-fed local track. Capture code pushes encoded frames through
/// [`RtcLocalTrack::write_sample`] until the track is stopped.
pub struct RtcLocalTrack {
    id: String,
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    stopped: AtomicBool,
}

impl RtcLocalTrack {
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let (id, mime_type) = match kind {
            MediaKind::Audio => ("audio", MIME_TYPE_OPUS),
            MediaKind::Video => ("video", MIME_TYPE_VP8),
        };
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            stream_id.to_owned(),
        );
        Self {
            id: id.to_owned(),
            kind,
            track: Arc::new(track),
            stopped: AtomicBool::new(false),
        }
    }

    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), MediaError> {
        if self.is_stopped() {
            return Ok(());
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

impl LocalTrack for RtcLocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!(track = %self.id, "Local track stopped");
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn rtp_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        Some(Arc::clone(&self.track))
    }
}

/// Hands out sample-fed tracks. The most recent set is kept so the
/// capture side can find what to write into.
#[derive(Default)]
pub struct RtcDevices {
    current: Mutex<Vec<Arc<RtcLocalTrack>>>,
}

impl RtcDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_tracks(&self) -> Vec<Arc<RtcLocalTrack>> {
        self.current
            .lock()
            .map(|tracks| tracks.iter().filter(|t| !t.is_stopped()).cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MediaDevices for RtcDevices {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError> {
        if !constraints.audio && !constraints.video {
            return Err(MediaError::DeviceUnavailable("no media requested".into()));
        }
        let stream_id = "parla-local";
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(RtcLocalTrack::new(MediaKind::Audio, stream_id)));
        }
        if constraints.video {
            tracks.push(Arc::new(RtcLocalTrack::new(MediaKind::Video, stream_id)));
        }
        if let Ok(mut current) = self.current.lock() {
            *current = tracks.clone();
        }
        Ok(tracks
            .into_iter()
            .map(|t| t as Arc<dyn LocalTrack>)
            .collect())
    }
}
