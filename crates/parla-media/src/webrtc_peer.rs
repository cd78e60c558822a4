use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parla_shared::protocol::{IceCandidate, IceServer, SessionDescription};
use parla_shared::types::UserId;
use tokio::sync::mpsc;
use tracing::debug;

use crate::devices::{LocalTrack, RemoteSink};
use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks from a peer connection, funneled into the call's event loop.
pub enum PeerEvent {
    IceCandidate {
        peer: UserId,
        candidate: IceCandidate,
    },
    StateChanged {
        peer: UserId,
        state: LinkState,
    },
    RemoteTrack {
        peer: UserId,
        sink: Arc<dyn RemoteSink>,
    },
}

/// One peer connection to one remote participant.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn add_local_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), MediaError>;

    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    /// Create an answer and install it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Stop delivering [`PeerEvent`]s for this link.
    fn detach_handlers(&self);

    async fn close(&self) -> Result<(), MediaError>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        peer: &UserId,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>, MediaError>;
}

pub struct PeerEntry {
    pub link: Arc<dyn PeerLink>,
    pub state: LinkState,
    pub sinks: Vec<Arc<dyn RemoteSink>>,
    pub ever_connected: bool,
    remote_description_set: bool,
}

/// Star topology: one link per remote participant, keyed by user id.
pub struct PeerMap {
    local_user: UserId,
    peers: HashMap<UserId, PeerEntry>,
    /// Candidates that arrived before the remote description
    pending_ice: HashMap<UserId, Vec<IceCandidate>>,
}

impl PeerMap {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            peers: HashMap::new(),
            pending_ice: HashMap::new(),
        }
    }

    /// Register a link. Returns the entry it replaced, if any, so the caller
    /// can close it.
    pub fn insert(&mut self, peer: UserId, link: Arc<dyn PeerLink>) -> Option<PeerEntry> {
        debug!(local = %self.local_user.short(), peer = %peer.short(), "Adding peer");
        self.peers.insert(
            peer,
            PeerEntry {
                link,
                state: LinkState::New,
                sinks: Vec::new(),
                ever_connected: false,
                remote_description_set: false,
            },
        )
    }

    pub fn remove(&mut self, peer: &UserId) -> Option<PeerEntry> {
        self.pending_ice.remove(peer);
        let removed = self.peers.remove(peer);
        if removed.is_some() {
            debug!(peer = %peer.short(), "Removed peer");
        }
        removed
    }

    pub fn get(&self, peer: &UserId) -> Option<&PeerEntry> {
        self.peers.get(peer)
    }

    pub fn contains(&self, peer: &UserId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn link(&self, peer: &UserId) -> Option<Arc<dyn PeerLink>> {
        self.peers.get(peer).map(|e| Arc::clone(&e.link))
    }

    /// Record a state transition. Returns the entry after the update.
    pub fn set_state(&mut self, peer: &UserId, state: LinkState) -> Option<&PeerEntry> {
        let entry = self.peers.get_mut(peer)?;
        entry.state = state;
        if state == LinkState::Connected {
            entry.ever_connected = true;
        }
        Some(entry)
    }

    /// Keep a remote sink so teardown can detach it. Returns false for an
    /// unknown peer; the caller should detach the sink itself.
    pub fn attach_sink(&mut self, peer: &UserId, sink: Arc<dyn RemoteSink>) -> bool {
        match self.peers.get_mut(peer) {
            Some(entry) => {
                entry.sinks.push(sink);
                true
            }
            None => false,
        }
    }

    /// Queue a candidate, or return it if it can be applied right away.
    pub fn buffer_candidate(&mut self, peer: &UserId, candidate: IceCandidate) -> Option<IceCandidate> {
        match self.peers.get(peer) {
            Some(entry) if entry.remote_description_set => Some(candidate),
            _ => {
                self.pending_ice
                    .entry(peer.clone())
                    .or_default()
                    .push(candidate);
                None
            }
        }
    }

    /// Mark the remote description as applied and hand back anything queued.
    pub fn remote_description_applied(&mut self, peer: &UserId) -> Vec<IceCandidate> {
        if let Some(entry) = self.peers.get_mut(peer) {
            entry.remote_description_set = true;
        }
        self.pending_ice.remove(peer).unwrap_or_default()
    }

    pub fn connected_peers(&self) -> Vec<&UserId> {
        self.peers
            .iter()
            .filter(|(_, e)| e.state == LinkState::Connected)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Take every entry, leaving the map empty.
    pub fn drain(&mut self) -> Vec<(UserId, PeerEntry)> {
        self.pending_ice.clear();
        self.peers.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parla_shared::protocol::SdpKind;

    struct NullLink;

    #[async_trait]
    impl PeerLink for NullLink {
        async fn add_local_track(&self, _track: Arc<dyn LocalTrack>) -> Result<(), MediaError> {
            Ok(())
        }
        async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
            Ok(SessionDescription {
                kind: SdpKind::Offer,
                sdp: String::new(),
            })
        }
        async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
            Ok(SessionDescription {
                kind: SdpKind::Answer,
                sdp: String::new(),
            })
        }
        async fn set_remote_description(&self, _sdp: SessionDescription) -> Result<(), MediaError> {
            Ok(())
        }
        async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), MediaError> {
            Ok(())
        }
        fn detach_handlers(&self) {}
        async fn close(&self) -> Result<(), MediaError> {
            Ok(())
        }
    }

    fn candidate(n: u8) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n}"),
            sdp_mid: None,
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn candidates_wait_for_remote_description() {
        let mut map = PeerMap::new(UserId::new("me"));
        let peer = UserId::new("a");

        // Before the link even exists.
        assert!(map.buffer_candidate(&peer, candidate(1)).is_none());
        map.insert(peer.clone(), Arc::new(NullLink));
        assert!(map.buffer_candidate(&peer, candidate(2)).is_none());

        let queued = map.remote_description_applied(&peer);
        assert_eq!(queued.len(), 2);
        assert!(map.buffer_candidate(&peer, candidate(3)).is_some());
    }

    #[test]
    fn peers_are_independent() {
        let mut map = PeerMap::new(UserId::new("me"));
        let a = UserId::new("a");
        let b = UserId::new("b");
        map.insert(a.clone(), Arc::new(NullLink));
        map.insert(b.clone(), Arc::new(NullLink));
        map.set_state(&a, LinkState::Connected);
        map.set_state(&b, LinkState::Connected);

        assert!(map.remove(&a).is_some());
        assert_eq!(map.connected_peers(), vec![&b]);
        assert!(map.get(&b).unwrap().ever_connected);
    }
}
