//! Pub/sub topic and rate-limit key builders.
//!
//! Topic names are part of the external interface:
//!
//! ```text
//! document:<uuid>:operations   committed operations, in sequence order
//! document:<uuid>:presence     presence joined/refreshed/left events
//! ```

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use concord_core::{AuthorId, DocumentId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Operations(DocumentId),
    Presence(DocumentId),
}

impl Topic {
    pub fn document(&self) -> DocumentId {
        match self {
            Topic::Operations(id) | Topic::Presence(id) => *id,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Operations(id) => write!(f, "document:{id}:operations"),
            Topic::Presence(id) => write!(f, "document:{id}:presence"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid topic: {0}")]
pub struct InvalidTopic(pub String);

impl FromStr for Topic {
    type Err = InvalidTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidTopic(s.to_string());
        let mut parts = s.split(':');
        let (Some("document"), Some(id), Some(kind), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        let id = DocumentId::parse_str(id).map_err(|_| invalid())?;
        match kind {
            "operations" => Ok(Topic::Operations(id)),
            "presence" => Ok(Topic::Presence(id)),
            _ => Err(invalid()),
        }
    }
}

/// Rate-limit key for writes by `author` to `document`.
pub fn write_limit_key(document: DocumentId, author: &AuthorId) -> String {
    format!("ratelimit:write:{document}:{author}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        let id = DocumentId::new_v4();
        assert_eq!(Topic::Operations(id).to_string(), format!("document:{id}:operations"));
        assert_eq!(Topic::Presence(id).to_string(), format!("document:{id}:presence"));
    }

    #[test]
    fn test_topic_parse() {
        let id = DocumentId::new_v4();
        let parsed: Topic = format!("document:{id}:presence").parse().unwrap();
        assert_eq!(parsed, Topic::Presence(id));
        assert_eq!(parsed.document(), id);
    }

    #[test]
    fn test_topic_parse_rejects_garbage() {
        assert!("document:nope:operations".parse::<Topic>().is_err());
        assert!("doc:x".parse::<Topic>().is_err());
        let id = DocumentId::new_v4();
        assert!(format!("document:{id}:comments").parse::<Topic>().is_err());
        assert!(format!("document:{id}:operations:extra").parse::<Topic>().is_err());
    }

    #[test]
    fn test_invalid_topic_is_a_std_error() {
        let err = "doc:x".parse::<Topic>().unwrap_err();
        assert_eq!(err.to_string(), "invalid topic: doc:x");
        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert!(boxed.source().is_none());
    }

    #[test]
    fn test_write_limit_key_is_per_pair() {
        let id = DocumentId::new_v4();
        let a = write_limit_key(id, &AuthorId::from("a"));
        let b = write_limit_key(id, &AuthorId::from("b"));
        assert_ne!(a, b);
        assert!(a.ends_with(":a"));
    }
}
