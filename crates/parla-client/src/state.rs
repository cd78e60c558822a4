//! Client state shared by commands, the socket bridge and background tasks.
//!
//! [`ClientState`] is wrapped in `Arc<Mutex<>>` inside [`Client`]. The lock
//! is a std mutex and is never held across an `.await`: every async
//! continuation re-locks and re-checks the open conversation before it
//! applies anything.

use std::sync::{Arc, Mutex, MutexGuard};

use parla_media::{CallHandle, MediaDevices, PeerFactory};
use parla_shared::{ConversationId, UserId};
use parla_store::{Conversation, ConversationStore, Database, MessageCache};

use crate::api::ChatBackend;
use crate::config::ClientConfig;
use crate::contacts::ContactBook;
use crate::dispatcher::DedupSet;
use crate::error::{ClientError, Result};
use crate::events::{emit_event, ClientEvent, EventSender};
use crate::overlay::OverlayRegistry;
use crate::scope::ConversationScope;
use crate::session::Session;
use crate::socket::SocketHandle;
use crate::thread::{RenderContext, ThreadView};

/// Central client state.
pub struct ClientState {
    /// Resolved identity and bearer token.
    pub session: Session,

    pub config: Arc<ClientConfig>,

    /// Conversation list in display order.
    pub conversations: ConversationStore,

    /// Every message seen this session, keyed by server id.
    pub cache: MessageCache,

    /// Contacts and the presence map.
    pub contacts: ContactBook,

    /// Render model of the open conversation.
    pub thread: ThreadView,

    /// Keys of new-message events already handled.
    pub dedup: DedupSet,

    /// Bumped by every typing or presence update. A pending typing reset
    /// only clears the label if the generation it captured is still current.
    pub typing_generation: u64,

    pub overlays: OverlayRegistry,

    /// Client-local preferences.
    pub db: Database,

    /// The running call, if any.
    pub call: Option<CallHandle>,

    /// Background tasks bound to the open conversation.
    pub scope: ConversationScope,

    pub socket: SocketHandle,
}

impl ClientState {
    pub fn new(session: Session, config: Arc<ClientConfig>, db: Database, socket: SocketHandle) -> Self {
        let me = session.user_id().clone();
        Self {
            session,
            config,
            conversations: ConversationStore::new(me.clone()),
            cache: MessageCache::new(),
            contacts: ContactBook::new(me),
            thread: ThreadView::new(),
            dedup: DedupSet::default(),
            typing_generation: 0,
            overlays: OverlayRegistry::new(),
            db,
            call: None,
            scope: ConversationScope::new(),
            socket,
        }
    }

    pub fn local_user(&self) -> &UserId {
        self.session.user_id()
    }

    pub fn open_conversation(&self) -> Option<&ConversationId> {
        self.thread.conversation_id()
    }

    pub fn is_open(&self, id: &ConversationId) -> bool {
        self.thread.is_open(id)
    }

    /// Cached record of the open conversation.
    pub fn open_record(&self) -> Option<&Conversation> {
        self.open_conversation()
            .and_then(|id| self.conversations.get(id))
    }

    /// Name sent with our own typing events.
    pub fn display_name(&self) -> String {
        self.session
            .identity
            .name
            .clone()
            .or_else(|| self.session.identity.phone.clone())
            .unwrap_or_else(|| self.local_user().to_string())
    }

    /// The call slot, cleared first if the previous call already ended.
    pub fn active_call(&mut self) -> Option<&CallHandle> {
        if self.call.as_ref().is_some_and(CallHandle::is_finished) {
            self.call = None;
        }
        self.call.as_ref()
    }

    /// Run `f` against the open thread with a render context built from
    /// the rest of the state.
    pub fn with_thread<R>(&mut self, f: impl FnOnce(&mut ThreadView, &RenderContext<'_>) -> R) -> R {
        let Self {
            session,
            config,
            conversations,
            cache,
            contacts,
            thread,
            ..
        } = self;
        let open = thread.conversation_id().cloned();
        let ctx = RenderContext {
            local_user: session.user_id(),
            contacts,
            cache,
            conversation: open.as_ref().and_then(|id| conversations.get(id)),
            offset: config.display_offset,
            subtitle_max_names: config.subtitle_max_names,
        };
        f(thread, &ctx)
    }
}

/// Peer-connection and device seams used for calls.
#[derive(Clone)]
pub struct MediaStack {
    pub peers: Arc<dyn PeerFactory>,
    pub devices: Arc<dyn MediaDevices>,
}

/// Cloneable handle every command runs against.
#[derive(Clone)]
pub struct Client {
    state: Arc<Mutex<ClientState>>,
    backend: Arc<dyn ChatBackend>,
    socket: SocketHandle,
    events: EventSender,
    config: Arc<ClientConfig>,
    local_user: UserId,
    media: MediaStack,
}

impl Client {
    pub fn new(
        state: ClientState,
        backend: Arc<dyn ChatBackend>,
        events: EventSender,
        media: MediaStack,
    ) -> Self {
        Self {
            socket: state.socket.clone(),
            config: state.config.clone(),
            local_user: state.local_user().clone(),
            state: Arc::new(Mutex::new(state)),
            backend,
            events,
            media,
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, ClientState>> {
        self.state.lock().map_err(|_| ClientError::LockPoisoned)
    }

    /// Run `f` with the state locked. Never call across an `.await`.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut ClientState) -> R) -> Result<R> {
        let mut state = self.lock()?;
        Ok(f(&mut state))
    }

    pub fn backend(&self) -> Arc<dyn ChatBackend> {
        self.backend.clone()
    }

    pub fn socket(&self) -> &SocketHandle {
        &self.socket
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn media(&self) -> &MediaStack {
        &self.media
    }

    pub fn emit(&self, event: ClientEvent) {
        emit_event(&self.events, event);
    }

    /// Report a failed user action as a toast.
    pub fn toast(&self, error: &ClientError) {
        self.emit(ClientEvent::Toast {
            message: error.user_message(),
        });
    }

    /// Snapshot of the conversation list for painting.
    pub fn conversations(&self) -> Result<Vec<Conversation>> {
        self.with_state(|s| s.conversations.list().to_vec())
    }

    /// Snapshot of the open thread for painting.
    pub fn thread(&self) -> Result<ThreadView> {
        self.with_state(|s| s.thread.clone())
    }
}
