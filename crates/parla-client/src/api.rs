//! REST backend client.
//!
//! [`ChatBackend`] is the seam every command talks to; [`HttpBackend`] is
//! the `reqwest` implementation. Non-2xx responses become
//! [`ClientError::Status`] carrying the most specific message the body has.

use std::collections::HashMap;

use async_trait::async_trait;
use parla_shared::protocol::{
    parse_lenient, ContactPayload, ConversationPayload, EditedMessage, IceServer, MessagePayload,
    PresencePayload, ReceiptPayload,
};
use parla_shared::{ConversationId, DeleteMode, MessageId, ReceiptState, UserId};
use reqwest::header::HeaderMap;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::session::Session;

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn list_conversations(&self, user: &UserId) -> Result<Vec<ConversationPayload>>;
    async fn list_contacts(&self) -> Result<Vec<ContactPayload>>;
    async fn list_messages(&self, conversation: &ConversationId) -> Result<Vec<MessagePayload>>;
    async fn send_message(
        &self,
        conversation: &ConversationId,
        body: &str,
        reply_to: Option<&MessageId>,
    ) -> Result<MessagePayload>;
    async fn edit_message(&self, message: &MessageId, body: &str) -> Result<EditedMessage>;
    async fn delete_message(&self, message: &MessageId, mode: DeleteMode) -> Result<()>;
    async fn delete_my_messages(&self, conversation: &ConversationId) -> Result<()>;
    async fn delete_conversation(&self, conversation: &ConversationId) -> Result<()>;
    async fn create_conversation(
        &self,
        is_group: bool,
        members: &[UserId],
        title: Option<&str>,
    ) -> Result<ConversationPayload>;
    async fn add_contact(&self, phone: &str, alias: Option<&str>) -> Result<ContactPayload>;
    async fn add_members(&self, conversation: &ConversationId, members: &[UserId]) -> Result<()>;
    async fn remove_member(&self, conversation: &ConversationId, user: &UserId) -> Result<()>;
    async fn mark_read(&self, conversation: &ConversationId) -> Result<()>;
    async fn set_receipt(&self, message: &MessageId, user: &UserId, state: ReceiptState) -> Result<()>;
    async fn message_receipts(&self, message: &MessageId) -> Result<Vec<ReceiptPayload>>;
    async fn conversation_receipts(
        &self,
        conversation: &ConversationId,
    ) -> Result<HashMap<MessageId, Vec<ReceiptPayload>>>;
    async fn upload_file(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<MessagePayload>;
    async fn mark_online(&self, user: &UserId) -> Result<()>;
    async fn mark_offline(&self, user: &UserId) -> Result<()>;
    async fn user_presence(&self, user: &UserId) -> Result<PresencePayload>;
    async fn ice_servers(&self) -> Result<Vec<IceServer>>;
}

pub struct HttpBackend {
    client: reqwest::Client,
    base: String,
    json_headers: HeaderMap,
    auth_headers: HeaderMap,
}

impl HttpBackend {
    /// `base` must end with `/`; every path is appended to it.
    pub fn new(base: impl Into<String>, session: &Session) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base: base.into(),
            json_headers: session.headers(),
            auth_headers: session.auth_headers(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .headers(self.json_headers.clone())
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let url = response.url().path().to_string();
        let body = response.text().await.unwrap_or_default();
        let message = extract_error_message(&body);
        warn!(status = status.as_u16(), path = %url, message = %message, "Request failed");
        Err(ClientError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.send(request).await?;
        Ok(response.json().await?)
    }

    async fn fetch_list<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<Vec<T>> {
        let values: Vec<Value> = self.fetch(request).await?;
        let (items, skipped) = parse_lenient(values);
        if skipped > 0 {
            warn!(kind = what, skipped, "Skipped malformed entries");
        }
        Ok(items)
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn list_conversations(&self, user: &UserId) -> Result<Vec<ConversationPayload>> {
        self.fetch_list(self.request(Method::GET, &format!("chats/{user}")), "conversation")
            .await
    }

    async fn list_contacts(&self) -> Result<Vec<ContactPayload>> {
        self.fetch_list(self.request(Method::GET, "contactos"), "contact")
            .await
    }

    async fn list_messages(&self, conversation: &ConversationId) -> Result<Vec<MessagePayload>> {
        self.fetch_list(
            self.request(Method::GET, &format!("conversaciones/{conversation}/mensajes")),
            "message",
        )
        .await
    }

    async fn send_message(
        &self,
        conversation: &ConversationId,
        body: &str,
        reply_to: Option<&MessageId>,
    ) -> Result<MessagePayload> {
        let request = self
            .request(Method::POST, &format!("conversaciones/{conversation}/mensajes"))
            .json(&json!({
                "cuerpo": body,
                "mensaje_id_respuesta": reply_to,
                "mencionados": [],
            }));
        self.fetch(request).await
    }

    async fn edit_message(&self, message: &MessageId, body: &str) -> Result<EditedMessage> {
        let request = self
            .request(Method::PUT, &format!("mensajes/{message}"))
            .json(&json!({ "cuerpo": body }));
        self.fetch(request).await
    }

    async fn delete_message(&self, message: &MessageId, mode: DeleteMode) -> Result<()> {
        let path = format!("conversaciones/mensajes/{message}?modo={}", mode.as_query());
        self.send(self.request(Method::DELETE, &path)).await?;
        Ok(())
    }

    async fn delete_my_messages(&self, conversation: &ConversationId) -> Result<()> {
        let path = format!("conversaciones/{conversation}/mensajes");
        self.send(self.request(Method::DELETE, &path)).await?;
        Ok(())
    }

    async fn delete_conversation(&self, conversation: &ConversationId) -> Result<()> {
        let path = format!("conversaciones/{conversation}");
        self.send(self.request(Method::DELETE, &path)).await?;
        Ok(())
    }

    async fn create_conversation(
        &self,
        is_group: bool,
        members: &[UserId],
        title: Option<&str>,
    ) -> Result<ConversationPayload> {
        let request = self.request(Method::POST, "conversaciones").json(&json!({
            "es_grupo": is_group,
            "miembros": members,
            "titulo": title,
        }));
        self.fetch(request).await
    }

    async fn add_contact(&self, phone: &str, alias: Option<&str>) -> Result<ContactPayload> {
        let request = self.request(Method::POST, "contactos").json(&json!({
            "contacto_telefono": phone,
            "alias": alias.unwrap_or_default(),
        }));
        self.fetch(request).await.map_err(contact_error)
    }

    async fn add_members(&self, conversation: &ConversationId, members: &[UserId]) -> Result<()> {
        let request = self
            .request(
                Method::POST,
                &format!("conversaciones/{conversation}/miembros/agregar"),
            )
            .json(&json!({ "miembros": members }));
        self.send(request).await?;
        Ok(())
    }

    async fn remove_member(&self, conversation: &ConversationId, user: &UserId) -> Result<()> {
        let path = format!("conversaciones/{conversation}/miembros/{user}");
        self.send(self.request(Method::DELETE, &path)).await?;
        Ok(())
    }

    async fn mark_read(&self, conversation: &ConversationId) -> Result<()> {
        let path = format!("conversaciones/{conversation}/marcar_leidos");
        self.send(self.request(Method::PUT, &path)).await?;
        Ok(())
    }

    async fn set_receipt(&self, message: &MessageId, user: &UserId, state: ReceiptState) -> Result<()> {
        let request = self.request(Method::POST, "estados_mensaje").json(&json!({
            "mensaje_id": message,
            "usuario_id": user,
            "estado": state,
        }));
        self.send(request).await?;
        Ok(())
    }

    async fn message_receipts(&self, message: &MessageId) -> Result<Vec<ReceiptPayload>> {
        self.fetch_list(
            self.request(Method::GET, &format!("estados_mensaje/mensaje/{message}")),
            "receipt",
        )
        .await
    }

    async fn conversation_receipts(
        &self,
        conversation: &ConversationId,
    ) -> Result<HashMap<MessageId, Vec<ReceiptPayload>>> {
        let raw: HashMap<String, Value> = self
            .fetch(self.request(Method::GET, &format!("conversaciones/{conversation}/estados")))
            .await?;
        Ok(raw
            .into_iter()
            .filter_map(|(id, value)| match value {
                Value::Array(items) => Some((MessageId::new(id), parse_lenient(items).0)),
                _ => None,
            })
            .collect())
    }

    async fn upload_file(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<MessagePayload> {
        let form = Form::new()
            .part("file", Part::bytes(bytes).file_name(file_name.to_string()))
            .text("usuario_id", user.to_string());
        let request = self
            .client
            .post(self.url(&format!("conversaciones/{conversation}/archivo")))
            .headers(self.auth_headers.clone())
            .multipart(form);
        debug!(conversation = %conversation.short(), file = %file_name, "Uploading attachment");
        self.fetch(request).await
    }

    async fn mark_online(&self, user: &UserId) -> Result<()> {
        self.send(self.request(Method::POST, &format!("auth/marcar_online/{user}")))
            .await?;
        Ok(())
    }

    async fn mark_offline(&self, user: &UserId) -> Result<()> {
        self.send(self.request(Method::POST, &format!("auth/marcar_offline/{user}")))
            .await?;
        Ok(())
    }

    async fn user_presence(&self, user: &UserId) -> Result<PresencePayload> {
        self.fetch(self.request(Method::GET, &format!("auth/estado_usuario/{user}")))
            .await
    }

    async fn ice_servers(&self) -> Result<Vec<IceServer>> {
        #[derive(Deserialize)]
        struct IceResponse {
            #[serde(default)]
            ice_servers: Vec<Value>,
        }
        let response: IceResponse = self
            .fetch(self.request(Method::GET, "webrtc/ice-servers"))
            .await?;
        Ok(parse_lenient(response.ice_servers).0)
    }
}

/// First useful error text in a response body: a field-error list, then a
/// string `detail`, then `message`, then `error`, then `detail.msg`, then
/// the raw JSON.
pub fn extract_error_message(body: &str) -> String {
    let Ok(data) = serde_json::from_str::<Value>(body) else {
        return "Unexpected server response".to_string();
    };
    let text = |v: Option<&Value>| v.and_then(Value::as_str).map(str::to_string);

    if let Some(Value::Array(errors)) = data.get("detail") {
        let first = errors
            .iter()
            .find(|e| e.get("msg").is_some())
            .or_else(|| errors.first());
        return match first {
            Some(e) => text(e.get("msg")).unwrap_or_else(|| e.to_string()),
            None => data.to_string(),
        };
    }
    text(data.get("detail"))
        .or_else(|| text(data.get("message")))
        .or_else(|| text(data.get("error")))
        .or_else(|| text(data.get("detail").and_then(|d| d.get("msg"))))
        .unwrap_or_else(|| data.to_string())
}

/// Rewrite add-contact failures into messages a user can act on.
fn contact_error(err: ClientError) -> ClientError {
    let ClientError::Status { status, message } = err else {
        return err;
    };
    let message = match status {
        404 => "That number has no account".to_string(),
        400 if message.contains("ya está agregado") => "That contact is already in your list".to_string(),
        400 if message.contains("ti mismo") => "You cannot add yourself".to_string(),
        422 => "Invalid or badly formatted number".to_string(),
        _ => message,
    };
    ClientError::Status { status, message }
}
