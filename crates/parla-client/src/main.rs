//! Headless Parla client.
//!
//! Connects with the identity found in the environment, keeps the
//! conversation list in sync and logs every client event until Ctrl+C.

use parla_client::config::ClientConfig;
use parla_client::events::ClientEvent;
use parla_client::session::SessionSources;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    parla_client::init_tracing();
    info!("Starting Parla client v{}", env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    let mut running = parla_client::start(config, &SessionSources::from_env()).await?;

    loop {
        tokio::select! {
            event = running.events.recv() => match event {
                Some(ClientEvent::Toast { message }) => warn!(%message, "Toast"),
                Some(event) => info!(?event, "Client event"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    parla_client::shutdown(running).await;
    Ok(())
}
