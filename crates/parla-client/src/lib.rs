//! # parla-client
//!
//! Sync core of the Parla chat client: session, conversation list, the open
//! thread, receipts, the socket bridge and calls. A UI drives it through
//! [`commands`] and renders what arrives on the [`events`] channel.

pub mod api;
pub mod commands;
pub mod config;
pub mod contacts;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod overlay;
pub mod receipts;
pub mod render;
pub mod scope;
pub mod session;
pub mod socket;
pub mod socket_bridge;
pub mod state;
pub mod thread;

use std::sync::Arc;

use parla_media::{RtcDevices, RtcPeerFactory};
use parla_store::Database;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::api::HttpBackend;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::events::EventReceiver;
use crate::session::SessionSources;
use crate::state::{Client, ClientState, MediaStack};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("parla_client=debug,parla_store=info,parla_media=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// A connected client and the handles that keep it running.
pub struct Running {
    pub client: Client,
    pub events: EventReceiver,
    pub bridge: JoinHandle<()>,
}

/// Resolve the session, connect the socket and load the conversation list.
///
/// The last opened conversation is reopened when it still exists. Failing
/// to load the list or to report presence is logged, not fatal; the socket
/// reconnect triggers another load.
pub async fn start(config: ClientConfig, sources: &SessionSources) -> Result<Running> {
    let db = match &config.data_dir {
        Some(dir) => Database::open_in_dir(dir)?,
        None => Database::new()?,
    };
    let session = session::resolve(sources, &db)?;
    let backend = Arc::new(HttpBackend::new(config.api_url.clone(), &session)?);
    let (socket, notifications) = socket::spawn_socket(&config.socket_url);
    let media = MediaStack {
        peers: Arc::new(RtcPeerFactory::new()?),
        devices: Arc::new(RtcDevices::new()),
    };
    let (events_tx, events) = events::channel();

    info!(api = %config.api_url, socket = %config.socket_url, "Starting Parla client");
    let state = ClientState::new(session, Arc::new(config), db, socket);
    let client = Client::new(state, backend, events_tx, media);
    let bridge = socket_bridge::start_bridge(client.clone(), notifications);

    match commands::conversations::load_all(&client).await {
        Ok(_) => {
            if let Err(e) = commands::conversations::restore_last_opened(&client).await {
                warn!(error = %e, "Could not reopen the last conversation");
            }
        }
        Err(e) => warn!(error = %e, "Initial conversation load failed"),
    }
    // Failure is already logged.
    let _ = commands::presence::mark_online(&client).await;

    Ok(Running {
        client,
        events,
        bridge,
    })
}

/// Send the offline beacon and close the socket.
pub async fn shutdown(running: Running) {
    if let Err(e) = commands::presence::mark_offline_beacon(&running.client).await {
        warn!(error = %e, "Offline beacon task failed");
    }
    if let Ok(true) = commands::media::hang_up(&running.client) {
        info!("Call ended on shutdown");
    }
    running.client.socket().shutdown();
    running.bridge.abort();
    info!("Parla client stopped");
}
