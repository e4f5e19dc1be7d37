//! Item-level failures and the patterns retry/skip rules match them with.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed classification of what went wrong while reading, processing or
/// writing an item.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Connection,
    Unavailable,
    Deadlock,
    Parse,
    Validation,
    Constraint,
    Io,
    Resource,
    /// Anything an artifact cannot classify further
    Other,
}

/// Groups of error kinds a rule can match as a whole.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorFamily {
    /// Likely to succeed when attempted again
    Transient,
    /// Caused by the item's content
    Data,
    /// Caused by the environment
    Infrastructure,
}

impl ErrorKind {
    pub fn family(self) -> Option<ErrorFamily> {
        match self {
            ErrorKind::Timeout | ErrorKind::Connection | ErrorKind::Unavailable | ErrorKind::Deadlock => {
                Some(ErrorFamily::Transient)
            }
            ErrorKind::Parse | ErrorKind::Validation | ErrorKind::Constraint => Some(ErrorFamily::Data),
            ErrorKind::Io | ErrorKind::Resource => Some(ErrorFamily::Infrastructure),
            ErrorKind::Other => None,
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Deadlock => "deadlock",
            ErrorKind::Parse => "parse",
            ErrorKind::Validation => "validation",
            ErrorKind::Constraint => "constraint",
            ErrorKind::Io => "io",
            ErrorKind::Resource => "resource",
            ErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// What a retry/skip rule matches against.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "match", content = "value")]
pub enum ErrorPattern {
    Any,
    Family(ErrorFamily),
    Kind(ErrorKind),
}

impl ErrorPattern {
    pub fn matches(&self, kind: ErrorKind) -> bool {
        match self {
            ErrorPattern::Any => true,
            ErrorPattern::Family(family) => kind.family() == Some(*family),
            ErrorPattern::Kind(k) => *k == kind,
        }
    }
}

/// Failure raised by a reader, processor or writer.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ItemError {
    pub kind: ErrorKind,
    pub message: String,
    /// Index of the offending item within the write buffer, when a writer can
    /// tell which one failed.
    pub item_index: Option<usize>,
}

impl ItemError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            item_index: None,
        }
    }

    pub fn at_item(mut self, index: usize) -> Self {
        self.item_index = Some(index);
        self
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_pattern_matches_members_only() {
        let transient = ErrorPattern::Family(ErrorFamily::Transient);
        assert!(transient.matches(ErrorKind::Timeout));
        assert!(transient.matches(ErrorKind::Deadlock));
        assert!(!transient.matches(ErrorKind::Parse));
        assert!(!transient.matches(ErrorKind::Other));
    }

    #[test]
    fn kind_pattern_is_exact() {
        let p = ErrorPattern::Kind(ErrorKind::Constraint);
        assert!(p.matches(ErrorKind::Constraint));
        assert!(!p.matches(ErrorKind::Validation));
        assert!(ErrorPattern::Any.matches(ErrorKind::Other));
    }

    #[test]
    fn pattern_json_shape() {
        let p: ErrorPattern =
            serde_json::from_str(r#"{"match":"family","value":"data"}"#).unwrap();
        assert_eq!(p, ErrorPattern::Family(ErrorFamily::Data));
        let any: ErrorPattern = serde_json::from_str(r#"{"match":"any"}"#).unwrap();
        assert_eq!(any, ErrorPattern::Any);
    }

    #[test]
    fn item_error_display_includes_kind() {
        let e = ItemError::new(ErrorKind::Io, "disk full").at_item(3);
        assert_eq!(e.to_string(), "io: disk full");
        assert_eq!(e.item_index, Some(3));
    }
}
