//! Author identities and the namespace they must belong to.
//!
//! Author ids arrive pre-authenticated from the identity provider; this
//! module only checks that they are well-formed and fall inside the
//! configured namespace before they are allowed into a vector clock.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ValidationError;

/// Default maximum length of an author id in bytes.
pub const DEFAULT_MAX_AUTHOR_LEN: usize = 128;

/// Opaque author identity (user id, device id, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorId(String);

impl AuthorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AuthorId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for AuthorId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// The set of author ids a deployment accepts.
///
/// An empty prefix list admits any well-formed id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorNamespace {
    #[serde(default)]
    pub allowed_prefixes: Vec<String>,
    #[serde(default = "default_max_len")]
    pub max_len: usize,
}

fn default_max_len() -> usize {
    DEFAULT_MAX_AUTHOR_LEN
}

impl Default for AuthorNamespace {
    fn default() -> Self {
        Self {
            allowed_prefixes: Vec::new(),
            max_len: DEFAULT_MAX_AUTHOR_LEN,
        }
    }
}

impl AuthorNamespace {
    /// Namespace admitting only ids that start with one of `prefixes`.
    pub fn with_prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_prefixes: prefixes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Check that `author` is well-formed and inside the namespace.
    pub fn validate(&self, author: &AuthorId) -> Result<(), ValidationError> {
        let id = author.as_str();
        if id.is_empty() {
            return Err(ValidationError::MalformedAuthor("empty author id".into()));
        }
        if id.len() > self.max_len {
            return Err(ValidationError::MalformedAuthor(format!(
                "author id exceeds {} bytes",
                self.max_len
            )));
        }
        if id.chars().any(char::is_control) {
            return Err(ValidationError::MalformedAuthor(
                "author id contains control characters".into(),
            ));
        }
        if !self.allowed_prefixes.is_empty()
            && !self.allowed_prefixes.iter().any(|p| id.starts_with(p.as_str()))
        {
            return Err(ValidationError::UnknownAuthor(author.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_namespace_accepts_any_id() {
        let ns = AuthorNamespace::default();
        assert!(ns.validate(&AuthorId::from("alice")).is_ok());
        assert!(ns.validate(&AuthorId::from("user:42")).is_ok());
    }

    #[test]
    fn test_namespace_rejects_empty_and_control_chars() {
        let ns = AuthorNamespace::default();
        assert!(ns.validate(&AuthorId::from("")).is_err());
        assert!(ns.validate(&AuthorId::from("bad\nid")).is_err());
    }

    #[test]
    fn test_namespace_rejects_overlong_id() {
        let ns = AuthorNamespace {
            max_len: 4,
            ..AuthorNamespace::default()
        };
        assert!(ns.validate(&AuthorId::from("abcd")).is_ok());
        assert!(ns.validate(&AuthorId::from("abcde")).is_err());
    }

    #[test]
    fn test_prefix_namespace() {
        let ns = AuthorNamespace::with_prefixes(["user:", "device:"]);
        assert!(ns.validate(&AuthorId::from("user:alice")).is_ok());
        assert!(ns.validate(&AuthorId::from("device:7")).is_ok());
        match ns.validate(&AuthorId::from("bot:x")) {
            Err(ValidationError::UnknownAuthor(a)) => assert_eq!(a.as_str(), "bot:x"),
            other => panic!("expected UnknownAuthor, got {other:?}"),
        }
    }
}
