//! Render model for a thread.
//!
//! A [`RenderedMessage`] is everything a UI layer needs to paint one
//! message row. Time labels and tombstone strings are derived here so the
//! socket feed and local mutations produce identical rows.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use parla_shared::constants::{
    REPLY_PREVIEW_MAX_CHARS, TEXT_DELETED, TEXT_DELETED_BY_ME, TEXT_REPLY_FILE,
};
use parla_shared::{MessageId, UserId};
use parla_store::{AttachmentKind, Message, TickState};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyPreview {
    pub message_id: MessageId,
    pub author: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedAttachment {
    pub kind: AttachmentKind,
    pub url: String,
    pub name: String,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedMessage {
    /// Server id once known.
    pub message_id: Option<MessageId>,
    /// Key of an optimistic row that has not been confirmed yet.
    pub local_key: Option<Uuid>,
    pub is_mine: bool,
    pub system: bool,
    /// Sender label; only set for other people's messages in groups.
    pub author: Option<String>,
    pub body: String,
    pub time_label: String,
    pub reply: Option<ReplyPreview>,
    pub attachment: Option<RenderedAttachment>,
    pub reaction: Option<String>,
    pub tick: Option<TickState>,
    pub tombstoned: bool,
}

impl RenderedMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            message_id: None,
            local_key: None,
            is_mine: false,
            system: true,
            author: None,
            body: text.into(),
            time_label: String::new(),
            reply: None,
            attachment: None,
            reaction: None,
            tick: None,
            tombstoned: false,
        }
    }

    pub fn is(&self, id: &MessageId) -> bool {
        self.message_id.as_ref() == Some(id)
    }

    /// Replace the row with a deletion notice in place.
    pub fn tombstone(&mut self) -> bool {
        if self.tombstoned {
            return false;
        }
        self.tombstoned = true;
        self.body = tombstone_text(self.is_mine).to_string();
        self.reply = None;
        self.reaction = None;
        self.attachment = None;
        true
    }
}

pub fn tombstone_text(is_mine: bool) -> &'static str {
    if is_mine {
        TEXT_DELETED_BY_ME
    } else {
        TEXT_DELETED
    }
}

/// Cut to the preview length, appending an ellipsis when something was cut.
pub fn truncate_preview(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= REPLY_PREVIEW_MAX_CHARS {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(REPLY_PREVIEW_MAX_CHARS).collect();
    cut.push('…');
    cut
}

/// Text shown under a conversation in the list for its latest message.
pub fn list_preview(message: &Message, local_user: &UserId) -> String {
    if message.is_tombstoned() {
        return tombstone_text(message.is_from(local_user)).to_string();
    }
    if message.body.trim().is_empty() {
        if let Some(attachment) = &message.attachment {
            return format!("{TEXT_REPLY_FILE} {}", attachment.name);
        }
    }
    message.body.clone()
}

/// Parse a backend timestamp. Accepts RFC 3339 and naive ISO timestamps
/// (treated as UTC) with any number of fractional digits.
pub fn parse_server_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let raw = raw.trim_end_matches('Z');
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// `HH:MM` in the display offset, or empty when the timestamp is unusable.
pub fn time_label(raw: Option<&str>, offset: &FixedOffset) -> String {
    raw.and_then(parse_server_time)
        .map(|dt| dt.with_timezone(offset).format("%H:%M").to_string())
        .unwrap_or_default()
}

pub fn message_time_label(
    created_at: Option<&str>,
    edited_at: Option<&str>,
    offset: &FixedOffset,
) -> String {
    match edited_at {
        Some(edited) => {
            let time = time_label(Some(edited), offset);
            if time.is_empty() {
                "Edited".to_string()
            } else {
                format!("Edited {time}")
            }
        }
        None => time_label(created_at, offset),
    }
}

/// "last seen today at HH:MM" or "last seen DD/MM/YYYY at HH:MM".
pub fn last_seen_label(raw: &str, now: DateTime<Utc>, offset: &FixedOffset) -> Option<String> {
    let seen = parse_server_time(raw)?.with_timezone(offset);
    let today = now.with_timezone(offset).date_naive();
    let time = seen.format("%H:%M");
    if seen.date_naive() == today {
        Some(format!("last seen today at {time}"))
    } else {
        Some(format!("last seen {} at {time}", seen.format("%d/%m/%Y")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn timestamps_without_zone_are_utc() {
        let a = parse_server_time("2025-03-01T10:15:30.123456").unwrap();
        let b = parse_server_time("2025-03-01T10:15:30.123Z").unwrap();
        assert_eq!(a.timestamp(), b.timestamp());
        assert_eq!(time_label(Some("2025-03-01 10:15:30"), &utc()), "10:15");
        assert!(parse_server_time("yesterday").is_none());
    }

    #[test]
    fn labels_follow_display_offset() {
        let minus_five = FixedOffset::west_opt(5 * 3600).unwrap();
        assert_eq!(time_label(Some("2025-03-01T10:15:00+00:00"), &minus_five), "05:15");
        assert_eq!(
            message_time_label(Some("2025-03-01T10:15:00"), Some("2025-03-01T11:00:00"), &utc()),
            "Edited 11:00"
        );
    }

    #[test]
    fn preview_is_cut_at_120_chars() {
        let long = "a".repeat(200);
        let cut = truncate_preview(&long);
        assert_eq!(cut.chars().count(), 121);
        assert!(cut.ends_with('…'));
        assert_eq!(truncate_preview("short"), "short");
    }

    #[test]
    fn tombstone_strips_decorations() {
        let mut row = RenderedMessage::system("x");
        row.system = false;
        row.is_mine = true;
        row.reaction = Some("👍".into());
        row.reply = Some(ReplyPreview {
            message_id: MessageId::new("r"),
            author: None,
            text: "orig".into(),
        });
        assert!(row.tombstone());
        assert!(!row.tombstone());
        assert_eq!(row.body, TEXT_DELETED_BY_ME);
        assert!(row.reply.is_none() && row.reaction.is_none());
    }

    #[test]
    fn last_seen_today_vs_other_day() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).unwrap();
        assert_eq!(
            last_seen_label("2025-03-01T09:05:00", now, &utc()).as_deref(),
            Some("last seen today at 09:05")
        );
        assert_eq!(
            last_seen_label("2025-02-27T09:05:00", now, &utc()).as_deref(),
            Some("last seen 27/02/2025 at 09:05")
        );
    }
}
