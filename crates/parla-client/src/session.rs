//! Current-user identity and auth token.
//!
//! Identity comes from page metadata when the host provides it, otherwise
//! from the mirror kept in local storage. The token is taken from the page
//! URL, then the `auth_token` cookie, then the mirror, and is dropped if its
//! `sub` claim names somebody else.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parla_shared::UserId;
use parla_store::{Database, SessionMirror};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};

/// Identity fields embedded by the host page.
#[derive(Debug, Clone, Default)]
pub struct PageMeta {
    pub user_id: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
}

/// Everything the resolver can read at startup.
#[derive(Debug, Clone, Default)]
pub struct SessionSources {
    pub meta: PageMeta,
    /// Full URL the client was launched with.
    pub page_url: Option<String>,
    /// Raw `Cookie` header value.
    pub cookies: Option<String>,
}

impl SessionSources {
    /// `PARLA_USER_ID`, `PARLA_USER_NAME`, `PARLA_USER_PHONE`,
    /// `PARLA_PAGE_URL` and `PARLA_COOKIES`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            meta: PageMeta {
                user_id: lookup("PARLA_USER_ID"),
                name: lookup("PARLA_USER_NAME"),
                phone: lookup("PARLA_USER_PHONE"),
            },
            page_url: lookup("PARLA_PAGE_URL"),
            cookies: lookup("PARLA_COOKIES"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub name: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub identity: Identity,
    pub token: Option<String>,
}

impl Session {
    pub fn user_id(&self) -> &UserId {
        &self.identity.user_id
    }

    /// JSON content type plus a bearer token when one is present.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = self.auth_headers();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    /// Authorization only; multipart uploads set their own content type.
    pub fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.token {
            match HeaderValue::from_str(&format!("Bearer {token}")) {
                Ok(value) => {
                    headers.insert(AUTHORIZATION, value);
                }
                Err(_) => warn!("Token contains characters not allowed in a header"),
            }
        }
        headers
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn resolve(sources: &SessionSources, db: &Database) -> Result<Session> {
    let mirror = db.session_mirror();

    let identity = match non_empty(sources.meta.user_id.as_deref()) {
        Some(id) => Identity {
            user_id: UserId::new(id),
            name: non_empty(sources.meta.name.as_deref()),
            phone: non_empty(sources.meta.phone.as_deref()),
        },
        None => {
            let mirror = mirror.as_ref().ok_or(ClientError::NoIdentity)?;
            Identity {
                user_id: mirror.user_id.clone(),
                name: mirror.name.clone(),
                phone: mirror.phone.clone(),
            }
        }
    };

    let candidate = sources
        .page_url
        .as_deref()
        .and_then(token_from_url)
        .or_else(|| sources.cookies.as_deref().and_then(token_from_cookies))
        .or_else(|| {
            mirror
                .as_ref()
                .filter(|m| m.user_id == identity.user_id)
                .and_then(|m| m.token.clone())
        });

    let token = candidate.filter(|token| match token_subject(token) {
        Some(sub) if sub != identity.user_id.as_str() => {
            warn!(
                user = %identity.user_id.short(),
                "Discarding token issued for another user"
            );
            false
        }
        _ => true,
    });

    db.set_session_mirror(&SessionMirror {
        user_id: identity.user_id.clone(),
        name: identity.name.clone(),
        phone: identity.phone.clone(),
        token: token.clone(),
    })?;

    info!(
        user = %identity.user_id.short(),
        authenticated = token.is_some(),
        "Session resolved"
    );
    Ok(Session { identity, token })
}

fn token_from_url(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    let token = url
        .query_pairs()
        .find(|(k, _)| k == "jwt")
        .map(|(_, v)| v.into_owned());
    non_empty(token.as_deref())
}

fn token_from_cookies(header: &str) -> Option<String> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == "auth_token")
        .and_then(|(_, value)| non_empty(Some(value)))
}

/// `sub` claim of a JWT, without verifying the signature.
fn token_subject(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| debug!(error = %e, "Token payload is not base64url"))
        .ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    match claims.get("sub")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt(sub: &str) -> String {
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"{sub}","exp":1}}"#));
        format!("eyJhbGciOiJIUzI1NiJ9.{payload}.sig")
    }

    fn meta(id: &str) -> PageMeta {
        PageMeta {
            user_id: Some(id.into()),
            name: Some("Ana".into()),
            phone: Some("555".into()),
        }
    }

    #[test]
    fn meta_overrides_mirror_and_is_written_back() {
        let db = Database::open_in_memory().unwrap();
        db.set_session_mirror(&SessionMirror {
            user_id: UserId::new("old"),
            name: None,
            phone: None,
            token: Some(jwt("old")),
        })
        .unwrap();

        let session = resolve(
            &SessionSources {
                meta: meta("42"),
                ..Default::default()
            },
            &db,
        )
        .unwrap();
        assert_eq!(session.user_id().as_str(), "42");
        // The mirrored token belonged to the previous user.
        assert!(session.token.is_none());
        assert_eq!(db.session_mirror().unwrap().user_id.as_str(), "42");
    }

    #[test]
    fn url_token_wins_over_cookie() {
        let db = Database::open_in_memory().unwrap();
        let url_token = jwt("42");
        let sources = SessionSources {
            meta: meta("42"),
            page_url: Some(format!("https://chat.example.com/app?jwt={url_token}")),
            cookies: Some(format!("theme=dark; auth_token={}", jwt("42") + "x")),
        };
        let session = resolve(&sources, &db).unwrap();
        assert_eq!(session.token.as_deref(), Some(url_token.as_str()));
        assert!(session.headers().contains_key(AUTHORIZATION));
    }

    #[test]
    fn token_for_other_user_is_discarded() {
        let db = Database::open_in_memory().unwrap();
        let sources = SessionSources {
            meta: meta("42"),
            cookies: Some(format!("auth_token={}", jwt("7"))),
            ..Default::default()
        };
        let session = resolve(&sources, &db).unwrap();
        assert!(session.token.is_none());
        assert!(!session.headers().contains_key(AUTHORIZATION));
        assert_eq!(session.headers()[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn missing_identity_is_an_error() {
        let db = Database::open_in_memory().unwrap();
        let err = resolve(&SessionSources::default(), &db).unwrap_err();
        assert!(matches!(err, ClientError::NoIdentity));
    }

    #[test]
    fn opaque_token_is_kept() {
        let db = Database::open_in_memory().unwrap();
        let sources = SessionSources {
            meta: meta("42"),
            cookies: Some("auth_token=opaque".into()),
            ..Default::default()
        };
        let session = resolve(&sources, &db).unwrap();
        assert_eq!(session.token.as_deref(), Some("opaque"));
    }

    #[test]
    fn env_sources_fall_back_to_mirror() {
        let db = Database::open_in_memory().unwrap();
        let first = SessionSources::from_lookup(|key| match key {
            "PARLA_USER_ID" => Some("42".into()),
            "PARLA_COOKIES" => Some("auth_token=opaque".into()),
            _ => None,
        });
        resolve(&first, &db).unwrap();

        let later = resolve(&SessionSources::from_lookup(|_| None), &db).unwrap();
        assert_eq!(later.user_id().as_str(), "42");
        assert_eq!(later.token.as_deref(), Some("opaque"));
    }
}
