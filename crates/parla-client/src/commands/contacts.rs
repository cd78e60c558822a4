//! Adding contacts.

use parla_store::Contact;
use tracing::{info, warn};

use crate::commands::conversations;
use crate::contacts::digits;
use crate::error::{ClientError, Result};
use crate::events::ClientEvent;
use crate::overlay::Overlay;
use crate::state::Client;

/// Add the owner of `phone` to the contact list.
///
/// Blank numbers and the local user's own number are rejected before any
/// request is made. Server rejections arrive already rewritten into a
/// user-facing message.
pub async fn add_contact(client: &Client, phone: &str, alias: Option<&str>) -> Result<Contact> {
    let phone = phone.trim();
    let alias = alias.map(str::trim).filter(|a| !a.is_empty());
    if phone.is_empty() {
        return Err(ClientError::Validation("Enter a valid phone number".into()));
    }
    let own_phone = client.with_state(|state| state.session.identity.phone.clone())?;
    if own_phone.is_some_and(|own| own.trim() == phone || digits(&own) == digits(phone)) {
        return Err(ClientError::Validation("You cannot add yourself".into()));
    }

    let contact = match client.backend().add_contact(phone, alias).await {
        Ok(payload) => Contact::from(payload),
        Err(e) => {
            warn!(error = %e, "Add contact rejected");
            client.toast(&e);
            return Err(e);
        }
    };
    info!(contact = %contact.contact_id.short(), "Contact added");

    client.with_state(|state| {
        state.contacts.upsert(contact.clone());
        state.overlays.close(&Overlay::AddContact);
    })?;
    if let Err(e) = conversations::load_all(client).await {
        warn!(error = %e, "Reload after adding a contact failed");
    }
    client.emit(ClientEvent::Toast {
        message: "Contact added".into(),
    });
    Ok(contact)
}
