//! Call lifecycle for 1:1 and group calls.
//!
//! Each call runs as one task that owns its peer map, local tracks and
//! signaling session. Inbound signals and hang-up requests reach it through
//! a [`CallHandle`]; peer-connection callbacks arrive on a second channel.
//! Progress is published on a `watch` channel as [`CallStatus`].

use std::sync::Arc;
use std::time::Duration;

use parla_shared::protocol::{IceServer, RtcSignal, SessionDescription};
use parla_shared::types::{CallKind, ConversationId, UserId};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::devices::{LocalTrack, MediaConstraints, MediaDevices};
use crate::error::MediaError;
use crate::signaling::{CallState, EndReason, SignalChannel, SignalingAction, SignalingSession};
use crate::webrtc_peer::{LinkState, PeerEvent, PeerFactory, PeerLink, PeerMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTopology {
    Direct { peer: UserId },
    Group,
}

#[derive(Debug, Clone)]
pub struct CallSetup {
    pub conversation_id: ConversationId,
    pub local_user: UserId,
    pub role: CallRole,
    pub topology: CallTopology,
    pub kind: CallKind,
    pub ice_servers: Vec<IceServer>,
    /// The call is abandoned if no peer ever connects within this window.
    pub no_answer_timeout: Duration,
}

#[derive(Clone)]
pub struct CallDeps {
    pub peers: Arc<dyn PeerFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub channel: Arc<dyn SignalChannel>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStatus {
    pub state: CallState,
    pub reason: Option<EndReason>,
    pub connected_peers: usize,
}

enum CallCommand {
    Signal { group: bool, signal: RtcSignal },
    HangUp,
}

pub struct CallHandle {
    conversation_id: ConversationId,
    group: bool,
    commands: mpsc::UnboundedSender<CallCommand>,
    status: watch::Receiver<CallStatus>,
    task: JoinHandle<()>,
}

impl CallHandle {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn is_group(&self) -> bool {
        self.group
    }

    /// Forward an inbound signal. Returns false once the call has finished.
    pub fn signal(&self, group: bool, signal: RtcSignal) -> bool {
        self.commands
            .send(CallCommand::Signal { group, signal })
            .is_ok()
    }

    pub fn hang_up(&self) {
        let _ = self.commands.send(CallCommand::HangUp);
    }

    pub fn status(&self) -> CallStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.status.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the call reaches `Ended` or `Failed`.
    pub async fn finished(&mut self) -> CallStatus {
        loop {
            let current = self.status.borrow_and_update().clone();
            if current.state.is_terminal() {
                return current;
            }
            if self.status.changed().await.is_err() {
                return self.status.borrow().clone();
            }
        }
    }
}

/// Spawn the call task and return its handle.
pub fn start_call(setup: CallSetup, deps: CallDeps) -> CallHandle {
    let group = setup.topology == CallTopology::Group;
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(CallStatus {
        state: CallState::Idle,
        reason: None,
        connected_peers: 0,
    });

    let conversation_id = setup.conversation_id.clone();
    let actor = CallActor {
        signaling: SignalingSession::new(
            setup.local_user.clone(),
            setup.conversation_id.clone(),
            group,
        ),
        peers: PeerMap::new(setup.local_user.clone()),
        tracks: Vec::new(),
        status: status_tx,
        events: events_tx,
        ever_connected: false,
        awaiting_peer: false,
        setup,
        deps,
    };
    let task = tokio::spawn(actor.run(commands_rx, events_rx));

    CallHandle {
        conversation_id,
        group,
        commands: commands_tx,
        status: status_rx,
        task,
    }
}

struct CallActor {
    setup: CallSetup,
    deps: CallDeps,
    signaling: SignalingSession,
    peers: PeerMap,
    tracks: Vec<Arc<dyn LocalTrack>>,
    status: watch::Sender<CallStatus>,
    events: mpsc::UnboundedSender<PeerEvent>,
    ever_connected: bool,
    /// 1:1 caller waiting for the callee to join before offering
    awaiting_peer: bool,
}

impl CallActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<CallCommand>,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        info!(
            conversation = %self.setup.conversation_id.short(),
            role = ?self.setup.role,
            group = self.signaling.group,
            "Starting call"
        );
        let reason = match self.begin().await {
            Ok(()) => self.event_loop(&mut commands, &mut events).await,
            Err(reason) => reason,
        };
        self.teardown(reason).await;
    }

    async fn begin(&mut self) -> Result<(), EndReason> {
        self.set_state(CallState::Dialing);
        match (&self.setup.topology, self.setup.role) {
            (CallTopology::Direct { peer }, CallRole::Caller) => {
                let peer = peer.clone();
                self.acquire_media().await?;
                self.open_link(&peer).await.map_err(|e| {
                    warn!(error = %e, "Failed to create peer connection");
                    EndReason::SignalingError
                })?;
                self.emit(self.signaling.invite(&peer, self.setup.kind))?;
                self.emit(self.signaling.join())?;
                self.emit(self.signaling.caller_ready())?;
                self.awaiting_peer = true;
            }
            (CallTopology::Direct { .. }, CallRole::Callee) => {
                self.emit(self.signaling.join())?;
            }
            (CallTopology::Group, _) => {
                self.emit(self.signaling.join())?;
                self.acquire_media().await?;
                self.emit(self.signaling.request_participants())?;
            }
        }
        Ok(())
    }

    async fn event_loop(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<CallCommand>,
        events: &mut mpsc::UnboundedReceiver<PeerEvent>,
    ) -> EndReason {
        let deadline = tokio::time::sleep(self.setup.no_answer_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(CallCommand::Signal { group, signal }) => {
                        let Some(action) = self.signaling.handle_signal(group, signal) else {
                            continue;
                        };
                        if let Some(reason) = self.on_action(action).await {
                            return reason;
                        }
                    }
                    Some(CallCommand::HangUp) | None => return EndReason::HungUp,
                },
                Some(event) = events.recv() => {
                    if let Some(reason) = self.on_peer_event(event).await {
                        return reason;
                    }
                }
                _ = &mut deadline, if !self.ever_connected => {
                    info!(conversation = %self.setup.conversation_id.short(), "Call not answered in time");
                    return EndReason::NoAnswer;
                }
            }
        }
    }

    async fn on_action(&mut self, action: SignalingAction) -> Option<EndReason> {
        match action {
            SignalingAction::PeerJoined(user) => {
                let expected = match &self.setup.topology {
                    CallTopology::Direct { peer } => peer == &user,
                    CallTopology::Group => false,
                };
                if !(self.awaiting_peer && expected) {
                    return None;
                }
                self.awaiting_peer = false;
                self.send_offer(&user).await
            }
            SignalingAction::AnswerOffer { from, sdp } => self.answer_offer(from, sdp).await,
            SignalingAction::ApplyAnswer { from, sdp } => {
                let link = self.peers.link(&from)?;
                if let Err(e) = link.set_remote_description(sdp).await {
                    return self.peer_failed(&from, e).await;
                }
                self.flush_candidates(&from, &link).await;
                None
            }
            SignalingAction::AddIceCandidate { from, candidate } => {
                if let Some(candidate) = self.peers.buffer_candidate(&from, candidate) {
                    if let Some(link) = self.peers.link(&from) {
                        if let Err(e) = link.add_ice_candidate(candidate).await {
                            debug!(peer = %from.short(), error = %e, "Ignoring bad ICE candidate");
                        }
                    }
                }
                None
            }
            SignalingAction::PeerLeft(user) => {
                if self.signaling.group {
                    self.drop_peer(&user).await;
                    return self.group_emptied();
                }
                match &self.setup.topology {
                    CallTopology::Direct { peer } if peer == &user => Some(EndReason::CallEnded),
                    _ => None,
                }
            }
            SignalingAction::OfferTo(users) => {
                if !self.signaling.group {
                    return None;
                }
                for user in users {
                    if self.peers.contains(&user) {
                        continue;
                    }
                    if let Err(e) = self.open_link(&user).await {
                        warn!(peer = %user.short(), error = %e, "Failed to create peer connection");
                        continue;
                    }
                    if let Some(reason) = self.send_offer(&user).await {
                        return Some(reason);
                    }
                }
                None
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) -> Option<EndReason> {
        match event {
            PeerEvent::IceCandidate { peer, candidate } => {
                if !self.peers.contains(&peer) {
                    return None;
                }
                let event = self.signaling.ice_candidate(&peer, candidate);
                if let Err(e) = self.deps.channel.emit(event) {
                    warn!(error = %e, "Failed to relay ICE candidate");
                }
                None
            }
            PeerEvent::RemoteTrack { peer, sink } => {
                if !self.peers.attach_sink(&peer, Arc::clone(&sink)) {
                    sink.detach();
                }
                None
            }
            PeerEvent::StateChanged { peer, state } => self.on_link_state(peer, state).await,
        }
    }

    async fn on_link_state(&mut self, peer: UserId, state: LinkState) -> Option<EndReason> {
        let entry = self.peers.set_state(&peer, state)?;
        let peer_was_connected = entry.ever_connected;
        debug!(peer = %peer.short(), ?state, "Peer connection state changed");

        match state {
            LinkState::Connected => {
                self.ever_connected = true;
                self.set_state(CallState::Connected);
                None
            }
            LinkState::Failed => {
                if self.signaling.group {
                    self.drop_peer(&peer).await;
                    if !self.peers.is_empty() {
                        return None;
                    }
                }
                Some(if self.ever_connected {
                    EndReason::ConnectionLost
                } else {
                    EndReason::CouldNotConnect
                })
            }
            LinkState::Disconnected | LinkState::Closed if peer_was_connected => {
                if self.signaling.group {
                    self.drop_peer(&peer).await;
                    return self.group_emptied();
                }
                Some(EndReason::CallEnded)
            }
            _ => None,
        }
    }

    async fn acquire_media(&mut self) -> Result<(), EndReason> {
        if !self.tracks.is_empty() {
            return Ok(());
        }
        match self
            .deps
            .devices
            .acquire(MediaConstraints::from(self.setup.kind))
            .await
        {
            Ok(tracks) => {
                debug!(count = tracks.len(), "Acquired local media");
                self.tracks = tracks;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Local media unavailable");
                Err(EndReason::MediaUnavailable)
            }
        }
    }

    /// Create a link for `peer`, attach local tracks and register it.
    async fn open_link(&mut self, peer: &UserId) -> Result<Arc<dyn PeerLink>, MediaError> {
        let link = self
            .deps
            .peers
            .create(peer, &self.setup.ice_servers, self.events.clone())
            .await?;
        for track in &self.tracks {
            link.add_local_track(Arc::clone(track)).await?;
        }
        if let Some(previous) = self.peers.insert(peer.clone(), Arc::clone(&link)) {
            previous.link.detach_handlers();
            if let Err(e) = previous.link.close().await {
                debug!(peer = %peer.short(), error = %e, "Error closing replaced peer");
            }
            for sink in previous.sinks {
                sink.detach();
            }
        }
        Ok(link)
    }

    async fn send_offer(&mut self, peer: &UserId) -> Option<EndReason> {
        let link = self.peers.link(peer)?;
        self.set_negotiating();
        match link.create_offer().await {
            Ok(sdp) => self.emit(self.signaling.offer(peer, sdp)).err(),
            Err(e) => self.peer_failed(peer, e).await,
        }
    }

    async fn answer_offer(&mut self, from: UserId, sdp: SessionDescription) -> Option<EndReason> {
        match &self.setup.topology {
            CallTopology::Direct { peer } if peer != &from => return None,
            CallTopology::Direct { .. } if self.setup.role == CallRole::Caller => {
                debug!(peer = %from.short(), "Ignoring offer while calling");
                return None;
            }
            _ => {}
        }
        if let Err(reason) = self.acquire_media().await {
            return Some(reason);
        }
        let link = match self.open_link(&from).await {
            Ok(link) => link,
            Err(e) => return self.peer_failed(&from, e).await,
        };
        self.set_negotiating();

        if let Err(e) = link.set_remote_description(sdp).await {
            return self.peer_failed(&from, e).await;
        }
        self.flush_candidates(&from, &link).await;

        match link.create_answer().await {
            Ok(answer) => self.emit(self.signaling.answer(&from, answer)).err(),
            Err(e) => self.peer_failed(&from, e).await,
        }
    }

    async fn flush_candidates(&mut self, peer: &UserId, link: &Arc<dyn PeerLink>) {
        for candidate in self.peers.remote_description_applied(peer) {
            if let Err(e) = link.add_ice_candidate(candidate).await {
                debug!(peer = %peer.short(), error = %e, "Ignoring bad ICE candidate");
            }
        }
    }

    /// A negotiation step failed. In a group only that peer is dropped.
    async fn peer_failed(&mut self, peer: &UserId, error: MediaError) -> Option<EndReason> {
        warn!(peer = %peer.short(), error = %error, "Negotiation failed");
        if self.signaling.group {
            self.drop_peer(peer).await;
            return None;
        }
        Some(EndReason::SignalingError)
    }

    async fn drop_peer(&mut self, peer: &UserId) {
        let Some(entry) = self.peers.remove(peer) else {
            return;
        };
        entry.link.detach_handlers();
        if let Err(e) = entry.link.close().await {
            debug!(peer = %peer.short(), error = %e, "Error closing peer");
        }
        for sink in entry.sinks {
            sink.detach();
        }
        self.publish_peer_count();
    }

    fn group_emptied(&self) -> Option<EndReason> {
        (self.ever_connected && self.peers.is_empty()).then_some(EndReason::CallEnded)
    }

    fn emit(&self, event: parla_shared::protocol::OutboundEvent) -> Result<(), EndReason> {
        self.deps.channel.emit(event).map_err(|e| {
            warn!(error = %e, "Failed to emit call signaling");
            EndReason::SignalingError
        })
    }

    fn set_negotiating(&self) {
        if !self.ever_connected {
            self.set_state(CallState::Negotiating);
        }
    }

    fn set_state(&self, state: CallState) {
        let connected_peers = self.peers.connected_peers().len();
        self.status.send_modify(|s| {
            s.state = state;
            s.connected_peers = connected_peers;
        });
    }

    fn publish_peer_count(&self) {
        let connected_peers = self.peers.connected_peers().len();
        self.status.send_modify(|s| s.connected_peers = connected_peers);
    }

    /// Release everything in a fixed order. No step is skipped because an
    /// earlier one failed.
    async fn teardown(&mut self, reason: EndReason) {
        info!(
            conversation = %self.setup.conversation_id.short(),
            reason = reason.message(),
            peers = self.peers.len(),
            "Ending call"
        );
        let peers = self.peers.drain();

        for (_, entry) in &peers {
            entry.link.detach_handlers();
        }
        for (peer, entry) in &peers {
            if let Err(e) = entry.link.close().await {
                warn!(peer = %peer.short(), error = %e, "Failed to close peer connection");
            }
        }
        for track in self.tracks.drain(..) {
            track.stop();
        }
        for (_, entry) in &peers {
            for sink in &entry.sinks {
                sink.detach();
            }
        }
        if let Err(e) = self.deps.channel.emit(self.signaling.leave()) {
            warn!(error = %e, "Failed to announce call leave");
        }
        if let Err(e) = self
            .deps
            .channel
            .release_listeners(&self.setup.conversation_id)
        {
            warn!(error = %e, "Failed to release call listeners");
        }

        self.status.send_replace(CallStatus {
            state: reason.final_state(),
            reason: Some(reason),
            connected_peers: 0,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use parla_shared::protocol::{IceCandidate, OutboundEvent, SdpEnvelope, SdpKind};

    use super::*;
    use crate::devices::{MediaKind, RemoteSink};

    type Log = Arc<Mutex<Vec<String>>>;

    fn log(l: &Log, entry: impl Into<String>) {
        l.lock().unwrap().push(entry.into());
    }

    struct FakeTrack {
        log: Log,
        stopped: AtomicBool,
    }

    impl LocalTrack for FakeTrack {
        fn id(&self) -> &str {
            "mic"
        }
        fn kind(&self) -> MediaKind {
            MediaKind::Audio
        }
        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
            log(&self.log, "stop:mic");
        }
        fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    struct FakeSink {
        id: String,
        log: Log,
    }

    impl RemoteSink for FakeSink {
        fn peer_track_id(&self) -> &str {
            &self.id
        }
        fn detach(&self) {
            log(&self.log, format!("detach-sink:{}", self.id));
        }
    }

    struct FakeDevices {
        deny: bool,
        track: Arc<FakeTrack>,
    }

    #[async_trait]
    impl MediaDevices for FakeDevices {
        async fn acquire(
            &self,
            _constraints: MediaConstraints,
        ) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError> {
            if self.deny {
                return Err(MediaError::DeviceUnavailable("denied".into()));
            }
            Ok(vec![self.track.clone() as Arc<dyn LocalTrack>])
        }
    }

    struct FakeLink {
        peer: String,
        log: Log,
    }

    #[async_trait]
    impl PeerLink for FakeLink {
        async fn add_local_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), MediaError> {
            log(&self.log, format!("track:{}:{}", self.peer, track.id()));
            Ok(())
        }
        async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
            Ok(SessionDescription {
                kind: SdpKind::Offer,
                sdp: format!("offer-{}", self.peer),
            })
        }
        async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
            Ok(SessionDescription {
                kind: SdpKind::Answer,
                sdp: format!("answer-{}", self.peer),
            })
        }
        async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), MediaError> {
            log(&self.log, format!("remote:{}:{}", self.peer, sdp.sdp));
            Ok(())
        }
        async fn add_ice_candidate(&self, c: IceCandidate) -> Result<(), MediaError> {
            log(&self.log, format!("ice:{}:{}", self.peer, c.candidate));
            Ok(())
        }
        fn detach_handlers(&self) {
            log(&self.log, format!("detach:{}", self.peer));
        }
        async fn close(&self) -> Result<(), MediaError> {
            log(&self.log, format!("close:{}", self.peer));
            Err(MediaError::Signaling("already closed".into()))
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        log: Log,
        events: Mutex<HashMap<UserId, mpsc::UnboundedSender<PeerEvent>>>,
    }

    impl FakeFactory {
        fn push(&self, peer: &str, event: PeerEvent) {
            let events = self.events.lock().unwrap();
            events[&UserId::new(peer)].send(event).unwrap();
        }
        fn created(&self) -> usize {
            self.events.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PeerFactory for FakeFactory {
        async fn create(
            &self,
            peer: &UserId,
            _ice: &[IceServer],
            events: mpsc::UnboundedSender<PeerEvent>,
        ) -> Result<Arc<dyn PeerLink>, MediaError> {
            self.events.lock().unwrap().insert(peer.clone(), events);
            Ok(Arc::new(FakeLink {
                peer: peer.to_string(),
                log: self.log.clone(),
            }))
        }
    }

    #[derive(Default)]
    struct FakeChannel {
        log: Log,
        sent: Mutex<Vec<OutboundEvent>>,
    }

    impl FakeChannel {
        fn names(&self) -> Vec<&'static str> {
            self.sent.lock().unwrap().iter().map(|e| e.name()).collect()
        }
    }

    impl SignalChannel for FakeChannel {
        fn emit(&self, event: OutboundEvent) -> Result<(), MediaError> {
            log(&self.log, format!("emit:{}", event.name()));
            self.sent.lock().unwrap().push(event);
            Ok(())
        }
        fn release_listeners(&self, _c: &ConversationId) -> Result<(), MediaError> {
            log(&self.log, "release");
            Ok(())
        }
    }

    struct Harness {
        log: Log,
        track: Arc<FakeTrack>,
        factory: Arc<FakeFactory>,
        channel: Arc<FakeChannel>,
        deps: CallDeps,
    }

    fn harness(deny: bool) -> Harness {
        let log: Log = Arc::default();
        let track = Arc::new(FakeTrack {
            log: log.clone(),
            stopped: AtomicBool::new(false),
        });
        let factory = Arc::new(FakeFactory {
            log: log.clone(),
            ..Default::default()
        });
        let channel = Arc::new(FakeChannel {
            log: log.clone(),
            ..Default::default()
        });
        let deps = CallDeps {
            peers: factory.clone(),
            devices: Arc::new(FakeDevices {
                deny,
                track: track.clone(),
            }),
            channel: channel.clone(),
        };
        Harness {
            log,
            track,
            factory,
            channel,
            deps,
        }
    }

    fn setup(role: CallRole, topology: CallTopology, timeout_ms: u64) -> CallSetup {
        CallSetup {
            conversation_id: ConversationId::new("c"),
            local_user: UserId::new("me"),
            role,
            topology,
            kind: CallKind::Audio,
            ice_servers: Vec::new(),
            no_answer_timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn direct(peer: &str) -> CallTopology {
        CallTopology::Direct {
            peer: UserId::new(peer),
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn offer_from(peer: &str, to: &str) -> RtcSignal {
        RtcSignal::Offer(SdpEnvelope {
            conversation_id: ConversationId::new("c"),
            from: UserId::new(peer),
            to: UserId::new(to),
            sdp: SessionDescription {
                kind: SdpKind::Offer,
                sdp: format!("remote-offer-{peer}"),
            },
        })
    }

    #[tokio::test]
    async fn unanswered_call_ends_with_no_answer_and_stops_mic() {
        let h = harness(false);
        let mut call = start_call(setup(CallRole::Caller, direct("bob"), 60), h.deps.clone());

        let status = call.finished().await;
        assert_eq!(status.state, CallState::Ended);
        assert_eq!(status.reason, Some(EndReason::NoAnswer));
        assert!(h.track.is_stopped());

        let names = h.channel.names();
        assert_eq!(
            names,
            vec!["incoming_call", "rtc_join", "rtc_caller_ready", "rtc_leave"]
        );
    }

    #[tokio::test]
    async fn caller_offers_only_after_peer_joins() {
        let h = harness(false);
        let call = start_call(setup(CallRole::Caller, direct("bob"), 5_000), h.deps.clone());

        wait_until(|| h.channel.names().contains(&"rtc_caller_ready")).await;
        assert!(!h.channel.names().contains(&"rtc_offer"));

        // Someone else joining the room does not trigger the offer.
        call.signal(
            false,
            RtcSignal::PeerJoined {
                conversation_id: ConversationId::new("c"),
                user_id: UserId::new("mallory"),
            },
        );
        call.signal(
            false,
            RtcSignal::PeerJoined {
                conversation_id: ConversationId::new("c"),
                user_id: UserId::new("bob"),
            },
        );
        wait_until(|| h.channel.names().contains(&"rtc_offer")).await;
        assert_eq!(call.status().state, CallState::Negotiating);

        let sent = h.channel.sent.lock().unwrap().clone();
        let offers: Vec<_> = sent
            .iter()
            .filter_map(|e| match e {
                OutboundEvent::RtcOffer(env) => Some(env.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].to, UserId::new("bob"));
        assert_eq!(offers[0].sdp.sdp, "offer-bob");
        call.hang_up();
    }

    #[tokio::test]
    async fn callee_answers_and_ends_when_connection_closes() {
        let h = harness(false);
        let mut call = start_call(setup(CallRole::Callee, direct("alice"), 5_000), h.deps.clone());

        wait_until(|| h.channel.names().contains(&"rtc_join")).await;
        assert_eq!(h.factory.created(), 0, "media and peer wait for the offer");

        call.signal(false, offer_from("alice", "me"));
        wait_until(|| h.channel.names().contains(&"rtc_answer")).await;

        h.factory.push(
            "alice",
            PeerEvent::StateChanged {
                peer: UserId::new("alice"),
                state: LinkState::Connected,
            },
        );
        wait_until(|| call.status().state == CallState::Connected).await;

        h.factory.push(
            "alice",
            PeerEvent::StateChanged {
                peer: UserId::new("alice"),
                state: LinkState::Closed,
            },
        );
        let status = call.finished().await;
        assert_eq!(status.reason, Some(EndReason::CallEnded));
        assert_eq!(status.state, CallState::Ended);
    }

    #[tokio::test]
    async fn failure_before_connect_is_could_not_connect() {
        let h = harness(false);
        let mut call = start_call(setup(CallRole::Callee, direct("alice"), 5_000), h.deps.clone());
        call.signal(false, offer_from("alice", "me"));
        wait_until(|| h.factory.created() == 1).await;

        h.factory.push(
            "alice",
            PeerEvent::StateChanged {
                peer: UserId::new("alice"),
                state: LinkState::Failed,
            },
        );
        let status = call.finished().await;
        assert_eq!(status.state, CallState::Failed);
        assert_eq!(status.reason, Some(EndReason::CouldNotConnect));
    }

    #[tokio::test]
    async fn teardown_runs_every_step_in_order() {
        let h = harness(false);
        let mut call = start_call(setup(CallRole::Callee, direct("alice"), 5_000), h.deps.clone());
        call.signal(false, offer_from("alice", "me"));
        wait_until(|| h.channel.names().contains(&"rtc_answer")).await;

        h.factory.push(
            "alice",
            PeerEvent::RemoteTrack {
                peer: UserId::new("alice"),
                sink: Arc::new(FakeSink {
                    id: "alice-audio".into(),
                    log: h.log.clone(),
                }),
            },
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        call.hang_up();
        let status = call.finished().await;
        assert_eq!(status.reason, Some(EndReason::HungUp));

        let log = h.log.lock().unwrap().clone();
        let pos = |needle: &str| {
            log.iter()
                .rposition(|l| l == needle)
                .unwrap_or_else(|| panic!("missing {needle} in {log:?}"))
        };
        // close() fails in the fake; later steps still run.
        assert!(pos("detach:alice") < pos("close:alice"));
        assert!(pos("close:alice") < pos("stop:mic"));
        assert!(pos("stop:mic") < pos("detach-sink:alice-audio"));
        assert!(pos("detach-sink:alice-audio") < pos("emit:rtc_leave"));
        assert!(pos("emit:rtc_leave") < pos("release"));
    }

    #[tokio::test]
    async fn denied_media_tears_down_without_peers() {
        let h = harness(true);
        let mut call = start_call(setup(CallRole::Caller, direct("bob"), 5_000), h.deps.clone());
        let status = call.finished().await;
        assert_eq!(status.reason, Some(EndReason::MediaUnavailable));
        assert_eq!(h.factory.created(), 0);
        assert!(h.channel.names().contains(&"rtc_leave"));
    }

    #[tokio::test]
    async fn ice_is_buffered_until_remote_description() {
        let h = harness(false);
        let call = start_call(setup(CallRole::Callee, direct("alice"), 5_000), h.deps.clone());
        call.signal(
            false,
            RtcSignal::IceCandidate(parla_shared::protocol::IceEnvelope {
                conversation_id: ConversationId::new("c"),
                from: UserId::new("alice"),
                to: UserId::new("me"),
                candidate: IceCandidate {
                    candidate: "early".into(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                    username_fragment: None,
                },
            }),
        );
        call.signal(false, offer_from("alice", "me"));
        wait_until(|| h.channel.names().contains(&"rtc_answer")).await;

        let log = h.log.lock().unwrap().clone();
        let remote = log.iter().position(|l| l.starts_with("remote:alice")).unwrap();
        let ice = log.iter().position(|l| l == "ice:alice:early").unwrap();
        assert!(remote < ice);
        call.hang_up();
    }

    #[tokio::test]
    async fn local_candidates_are_routed() {
        let h = harness(false);
        let call = start_call(setup(CallRole::Callee, direct("alice"), 5_000), h.deps.clone());
        call.signal(false, offer_from("alice", "me"));
        wait_until(|| h.factory.created() == 1).await;

        h.factory.push(
            "alice",
            PeerEvent::IceCandidate {
                peer: UserId::new("alice"),
                candidate: IceCandidate {
                    candidate: "candidate:local".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                },
            },
        );
        wait_until(|| h.channel.names().contains(&"rtc_ice_candidate")).await;
        let sent = h.channel.sent.lock().unwrap().clone();
        let env = sent
            .iter()
            .find_map(|e| match e {
                OutboundEvent::RtcIceCandidate(env) => Some(env.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(env.conversation_id, ConversationId::new("c"));
        assert_eq!(env.from, UserId::new("me"));
        assert_eq!(env.to, UserId::new("alice"));
        call.hang_up();
    }

    #[tokio::test]
    async fn group_join_offers_each_participant_and_survives_one_leaving() {
        let h = harness(false);
        let mut call = start_call(setup(CallRole::Caller, CallTopology::Group, 5_000), h.deps.clone());
        wait_until(|| h.channel.names().contains(&"rtc_group_request_participants")).await;

        call.signal(
            true,
            RtcSignal::Participants {
                conversation_id: Some(ConversationId::new("c")),
                users: vec![UserId::new("me"), UserId::new("a"), UserId::new("b")],
            },
        );
        wait_until(|| {
            h.channel
                .names()
                .iter()
                .filter(|n| **n == "rtc_offer_group")
                .count()
                == 2
        })
        .await;

        for peer in ["a", "b"] {
            h.factory.push(
                peer,
                PeerEvent::StateChanged {
                    peer: UserId::new(peer),
                    state: LinkState::Connected,
                },
            );
        }
        wait_until(|| call.status().connected_peers == 2).await;

        // A late joiner offers to us; only that peer is negotiated.
        call.signal(true, offer_from("c3", "me"));
        wait_until(|| h.channel.names().contains(&"rtc_answer_group")).await;

        call.signal(
            true,
            RtcSignal::PeerLeft {
                conversation_id: Some(ConversationId::new("c")),
                user_id: UserId::new("a"),
            },
        );
        wait_until(|| h.log.lock().unwrap().contains(&"close:a".to_string())).await;
        assert_eq!(call.status().state, CallState::Connected);
        assert!(!h.log.lock().unwrap().contains(&"close:b".to_string()));

        call.hang_up();
        let status = call.finished().await;
        assert_eq!(status.reason, Some(EndReason::HungUp));
        assert!(h.channel.names().contains(&"rtc_leave_group"));
    }
}
