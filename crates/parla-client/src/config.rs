//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so the client starts against a local
//! backend with zero configuration.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use parla_shared::constants::{CALL_TIMEOUT_SECS, RECEIPT_POLL_SECS, SUBTITLE_MAX_NAMES};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// REST base URL, always ending in `/`.
    /// Env: `PARLA_API_URL`
    /// Default: `http://localhost:8000/`
    pub api_url: String,

    /// Socket.IO origin (scheme + host).
    /// Env: `PARLA_SOCKET_URL`
    /// Default: same origin as the API
    pub socket_url: String,

    /// Directory for the local preference database.
    /// Env: `PARLA_DATA_DIR`
    /// Default: the platform data directory
    pub data_dir: Option<PathBuf>,

    /// Receipt reconciliation interval.
    /// Env: `PARLA_RECEIPT_POLL_SECS`
    pub receipt_poll: Duration,

    /// Calls that never connect are abandoned after this long.
    /// Env: `PARLA_CALL_TIMEOUT_SECS`
    pub call_timeout: Duration,

    /// Maximum member names in a group subtitle.
    /// Env: `PARLA_SUBTITLE_MAX_NAMES`
    pub subtitle_max_names: usize,

    /// Offset used to display server timestamps.
    /// Env: `PARLA_UTC_OFFSET_MINUTES`
    /// Default: UTC
    pub display_offset: FixedOffset,
}

const DEFAULT_API_URL: &str = "http://localhost:8000/";

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            socket_url: "http://localhost:8000".to_string(),
            data_dir: None,
            receipt_poll: Duration::from_secs(RECEIPT_POLL_SECS),
            call_timeout: Duration::from_secs(CALL_TIMEOUT_SECS),
            subtitle_max_names: SUBTITLE_MAX_NAMES,
            display_offset: utc(),
        }
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] over an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let mut socket_set = false;

        if let Some(url) = lookup("PARLA_API_URL").filter(|v| !v.trim().is_empty()) {
            config.api_url = normalize_base(&url);
        }

        if let Some(url) = lookup("PARLA_SOCKET_URL").filter(|v| !v.trim().is_empty()) {
            config.socket_url = url.trim().trim_end_matches('/').to_string();
            socket_set = true;
        }
        if !socket_set {
            config.socket_url = origin_of(&config.api_url);
        }

        if let Some(dir) = lookup("PARLA_DATA_DIR").filter(|v| !v.trim().is_empty()) {
            config.data_dir = Some(PathBuf::from(dir));
        }

        if let Some(val) = lookup("PARLA_RECEIPT_POLL_SECS") {
            match val.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.receipt_poll = Duration::from_secs(secs),
                _ => warn!(value = %val, "Invalid PARLA_RECEIPT_POLL_SECS, using default"),
            }
        }

        if let Some(val) = lookup("PARLA_CALL_TIMEOUT_SECS") {
            match val.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.call_timeout = Duration::from_secs(secs),
                _ => warn!(value = %val, "Invalid PARLA_CALL_TIMEOUT_SECS, using default"),
            }
        }

        if let Some(val) = lookup("PARLA_SUBTITLE_MAX_NAMES") {
            match val.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.subtitle_max_names = n,
                _ => warn!(value = %val, "Invalid PARLA_SUBTITLE_MAX_NAMES, using default"),
            }
        }

        if let Some(val) = lookup("PARLA_UTC_OFFSET_MINUTES") {
            match val
                .trim()
                .parse::<i32>()
                .ok()
                .and_then(|m| m.checked_mul(60))
                .and_then(FixedOffset::east_opt)
            {
                Some(offset) => config.display_offset = offset,
                None => warn!(value = %val, "Invalid PARLA_UTC_OFFSET_MINUTES, using UTC"),
            }
        }

        config
    }
}

fn normalize_base(url: &str) -> String {
    let url = url.trim();
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

/// `scheme://host[:port]` of a URL, or the URL itself if it has no path.
fn origin_of(url: &str) -> String {
    match url.find("://") {
        Some(scheme_end) => {
            let rest = &url[scheme_end + 3..];
            let host_end = rest.find('/').map_or(url.len(), |i| scheme_end + 3 + i);
            url[..host_end].to_string()
        }
        None => url.trim_end_matches('/').to_string(),
    }
}
