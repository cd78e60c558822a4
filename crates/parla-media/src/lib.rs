//! # parla-media
//!
//! Call signaling and peer-connection management for 1:1 and group calls.
//! Group calls use a star of direct links, one per remote participant.

pub mod call;
pub mod devices;
pub mod error;
pub mod rtc;
pub mod signaling;
pub mod webrtc_peer;

pub use call::{start_call, CallDeps, CallHandle, CallRole, CallSetup, CallStatus, CallTopology};
pub use devices::{LocalTrack, MediaConstraints, MediaDevices, MediaKind, RemoteSink};
pub use error::MediaError;
pub use rtc::{RtcDevices, RtcPeerFactory};
pub use signaling::{CallState, EndReason, SignalChannel};
pub use webrtc_peer::{LinkState, PeerEvent, PeerFactory, PeerLink};
