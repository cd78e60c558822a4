//! Attachment upload.
//!
//! The file is read from disk and posted as multipart to the open
//! conversation. The server answers with the stored file message, which is
//! rendered as our own.

use std::path::Path;

use parla_shared::MessageId;
use tracing::{info, warn};

use crate::commands::messaging::{deliver_own, open_active};
use crate::error::{ClientError, Result};
use crate::events::ClientEvent;
use crate::overlay::Overlay;
use crate::state::Client;

/// Upload the file at `path` to the open conversation.
pub async fn upload_attachment(client: &Client, path: &Path) -> Result<Option<MessageId>> {
    let conversation_id = client.with_state(|state| {
        state.overlays.close(&Overlay::AttachMenu);
        open_active(state)
    })??;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ClientError::Validation("Choose a file to send".into()))?
        .to_string();

    let bytes = tokio::fs::read(path).await?;
    let size = bytes.len();

    let me = client.local_user().clone();
    let mut payload = match client
        .backend()
        .upload_file(&conversation_id, &me, &file_name, bytes)
        .await
    {
        Ok(payload) => payload,
        Err(e) => {
            warn!(conversation = %conversation_id.short(), error = %e, "Upload failed");
            client.emit(ClientEvent::Toast {
                message: "Could not upload the file".into(),
            });
            return Err(e);
        }
    };
    payload
        .conversation_id
        .get_or_insert_with(|| conversation_id.clone());
    let message_id = payload.id.clone();

    info!(
        conversation = %conversation_id.short(),
        file = %file_name,
        size,
        "Attachment uploaded"
    );
    deliver_own(client, payload)?;
    Ok(message_id)
}
