//! Key namespaces.
//!
//! A `KeyNamespace` maps logical identifiers onto store keys under a fixed
//! prefix, e.g. node `abc` → `/nodes/abc`. Identifiers are validated
//! before a key is built so that one entity can never address another
//! entity's record (or a whole subtree) through a crafted id.

use crate::error::{StateError, StateResult};

/// Separator between key segments.
pub const SEPARATOR: char = '/';

/// A validated key prefix, e.g. `/nodes/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    /// Create a namespace from a prefix.
    ///
    /// The prefix must start and end with `/` and must not contain empty
    /// segments (`//`).
    pub fn new(prefix: impl Into<String>) -> StateResult<Self> {
        let prefix = prefix.into();
        if prefix.len() < 2 || !prefix.starts_with(SEPARATOR) || !prefix.ends_with(SEPARATOR) {
            return Err(StateError::InvalidKey(format!(
                "prefix {prefix:?} must start and end with '{SEPARATOR}'"
            )));
        }
        if prefix.contains("//") {
            return Err(StateError::InvalidKey(format!(
                "prefix {prefix:?} contains an empty segment"
            )));
        }
        Ok(Self { prefix })
    }

    /// The raw prefix, including both separators.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build the key for `id`.
    ///
    /// Fails with `InvalidKey` if `id` is empty or contains the separator
    /// or a control character.
    pub fn key(&self, id: &str) -> StateResult<String> {
        validate_segment(id)?;
        Ok(format!("{}{}", self.prefix, id))
    }

    /// Recover the id from a key previously built by [`KeyNamespace::key`].
    ///
    /// Returns `None` for keys outside this namespace or in a nested one.
    pub fn id_from_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        let id = key.strip_prefix(self.prefix.as_str())?;
        validate_segment(id).ok().map(|()| id)
    }

    /// A nested namespace, e.g. `/pki/` + `ca` → `/pki/ca/`.
    pub fn child(&self, segment: &str) -> StateResult<KeyNamespace> {
        validate_segment(segment)?;
        KeyNamespace::new(format!("{}{}{}", self.prefix, segment, SEPARATOR))
    }
}

fn validate_segment(id: &str) -> StateResult<()> {
    if id.is_empty() {
        return Err(StateError::InvalidKey("empty identifier".to_string()));
    }
    if id.contains(SEPARATOR) {
        return Err(StateError::InvalidKey(format!(
            "identifier {id:?} contains '{SEPARATOR}'"
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(StateError::InvalidKey(format!(
            "identifier {id:?} contains a control character"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> KeyNamespace {
        KeyNamespace::new("/nodes/").unwrap()
    }

    #[test]
    fn key_appends_id() {
        assert_eq!(nodes().key("node-1").unwrap(), "/nodes/node-1");
    }

    #[test]
    fn key_rejects_empty_id() {
        let err = nodes().key("").unwrap_err();
        assert!(err.is_invalid_key());
    }

    #[test]
    fn key_rejects_separator() {
        assert!(nodes().key("a/b").is_err());
        assert!(nodes().key("/").is_err());
        assert!(nodes().key("..").is_ok());
    }

    #[test]
    fn key_rejects_control_characters() {
        assert!(nodes().key("node\0").is_err());
        assert!(nodes().key("node\n1").is_err());
    }

    #[test]
    fn prefix_must_be_delimited() {
        assert!(KeyNamespace::new("nodes/").is_err());
        assert!(KeyNamespace::new("/nodes").is_err());
        assert!(KeyNamespace::new("/").is_err());
        assert!(KeyNamespace::new("/a//b/").is_err());
        assert!(KeyNamespace::new("/a/b/").is_ok());
    }

    #[test]
    fn id_from_key_inverts_key() {
        let ns = nodes();
        let key = ns.key("node-7").unwrap();
        assert_eq!(ns.id_from_key(&key), Some("node-7"));
        assert_eq!(ns.id_from_key("/other/node-7"), None);
        assert_eq!(ns.id_from_key("/nodes/nested/node-7"), None);
    }

    #[test]
    fn child_nests_prefix() {
        let pki = KeyNamespace::new("/pki/").unwrap();
        let certs = pki.child("certs").unwrap();
        assert_eq!(certs.prefix(), "/pki/certs/");
        assert!(pki.child("a/b").is_err());
    }
}
