use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

/// Backend identifiers arrive either as UUID strings or as bare integers,
/// so every id newtype accepts both and normalizes to a string.
macro_rules! wire_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// First eight characters, for log lines.
            pub fn short(&self) -> &str {
                let end = self
                    .0
                    .char_indices()
                    .nth(8)
                    .map(|(i, _)| i)
                    .unwrap_or(self.0.len());
                &self.0[..end]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                deserializer.deserialize_any(IdVisitor).map(Self)
            }
        }
    };
}

wire_id!(
    /// A registered account on the backend
    UserId
);
wire_id!(
    /// A 1:1 chat or group
    ConversationId
);
wire_id!(
    /// A server-assigned message id
    MessageId
);

struct IdVisitor;

impl<'de> Visitor<'de> for IdVisitor {
    type Value = String;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a non-empty string or integer id")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<String, E> {
        let v = v.trim();
        if v.is_empty() || v == "null" || v == "None" || v == "undefined" {
            return Err(E::invalid_value(de::Unexpected::Str(v), &self));
        }
        Ok(v.to_string())
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<String, E> {
        Ok(v.to_string())
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<String, E> {
        Ok(v.to_string())
    }
}

/// What the caller asked the callee to open: microphone only or camera too
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    #[default]
    Audio,
    Video,
}

/// `modo` query/payload value for message deletion
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeleteMode {
    #[serde(rename = "para_mi")]
    ForMe,
    #[serde(rename = "para_todos")]
    ForEveryone,
}

impl DeleteMode {
    pub fn as_query(&self) -> &'static str {
        match self {
            Self::ForMe => "para_mi",
            Self::ForEveryone => "para_todos",
        }
    }
}

/// Per-observer delivery state as stored by the backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ReceiptState {
    #[serde(rename = "pendiente")]
    Pending,
    /// Legacy value, treated as delivered
    #[serde(rename = "enviado")]
    Sent,
    #[serde(rename = "entregado")]
    Delivered,
    #[serde(rename = "leido", alias = "leído")]
    Read,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_accept_strings_and_numbers() {
        let a: UserId = serde_json::from_str("\"a3dca4b3-8f9d\"").unwrap();
        let b: UserId = serde_json::from_str("42").unwrap();
        assert_eq!(a.as_str(), "a3dca4b3-8f9d");
        assert_eq!(b, UserId::new("42"));
        assert_eq!(serde_json::to_string(&b).unwrap(), "\"42\"");
    }

    #[test]
    fn ids_reject_blank_values() {
        assert!(serde_json::from_str::<ConversationId>("\"\"").is_err());
        assert!(serde_json::from_str::<ConversationId>("\"None\"").is_err());
        assert!(serde_json::from_str::<ConversationId>("null").is_err());
    }

    #[test]
    fn short_id_truncates() {
        assert_eq!(MessageId::new("0123456789abcdef").short(), "01234567");
        assert_eq!(MessageId::new("7").short(), "7");
    }

    #[test]
    fn receipt_states_use_wire_names() {
        let s: ReceiptState = serde_json::from_str("\"leido\"").unwrap();
        assert_eq!(s, ReceiptState::Read);
        let s: ReceiptState = serde_json::from_str("\"enviado\"").unwrap();
        assert_eq!(s, ReceiptState::Sent);
        assert_eq!(DeleteMode::ForEveryone.as_query(), "para_todos");
    }
}
