//! # Tags Matcher
//!
//! Append-only dictionary mapping JSON object keys to small integer tags,
//! used by the CJSON row encoding. The dictionary is versioned: every
//! extension bumps `version`, and a client that encoded rows against an
//! older version gets `TagsMismatch` until it refreshes.
//!
//! The matcher is copy-on-write at the namespace level: a writer that must
//! add a tag clones the matcher, extends the clone and swaps it in under the
//! exclusive lock, so concurrent readers keep a consistent snapshot.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// 1-based tag id; 0 is reserved as "no tag".
pub type TagId = u32;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagsMatcher {
    names: Vec<String>,
    #[serde(skip)]
    by_name: HashMap<String, TagId>,
    version: u32,
    state_token: u32,
}

impl TagsMatcher {
    pub fn new(state_token: u32) -> Self {
        Self {
            names: Vec::new(),
            by_name: HashMap::new(),
            version: 0,
            state_token,
        }
    }

    /// Rebuild the reverse map after deserialization.
    pub fn rebuild(&mut self) {
        self.by_name = self
            .names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as TagId + 1))
            .collect();
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn state_token(&self) -> u32 {
        self.state_token
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name_to_tag(&self, name: &str) -> Option<TagId> {
        self.by_name.get(name).copied()
    }

    /// Resolve or register a tag, bumping the version on extension.
    pub fn name_to_tag_mut(&mut self, name: &str) -> TagId {
        if let Some(tag) = self.by_name.get(name) {
            return *tag;
        }
        self.names.push(name.to_string());
        let tag = self.names.len() as TagId;
        self.by_name.insert(name.to_string(), tag);
        self.version += 1;
        tag
    }

    pub fn tag_to_name(&self, tag: TagId) -> Result<&str> {
        self.names
            .get(tag.checked_sub(1).ok_or_else(|| invalid_tag(tag))? as usize)
            .map(String::as_str)
            .ok_or_else(|| invalid_tag(tag))
    }

    /// Validate a client-side (version, state_token) pair before accepting
    /// pre-encoded CJSON from it.
    pub fn check_client_state(&self, version: u32, state_token: u32) -> Result<()> {
        if state_token != self.state_token {
            return Err(Error::new(
                ErrorKind::StateInvalidated,
                "tags state token mismatch, resend with fresh encoding",
            ));
        }
        if version < self.version {
            return Err(Error::new(
                ErrorKind::TagsMismatch,
                format!(
                    "tags version {} is behind server version {}",
                    version, self.version
                ),
            ));
        }
        Ok(())
    }
}

fn invalid_tag(tag: TagId) -> Error {
    Error::new(ErrorKind::TagsMismatch, format!("unknown tag {tag}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_stable_and_versioned() {
        let mut tm = TagsMatcher::new(0xfeed);
        let a = tm.name_to_tag_mut("title");
        let b = tm.name_to_tag_mut("year");
        assert_eq!(tm.name_to_tag_mut("title"), a);
        assert_ne!(a, b);
        assert_eq!(tm.version(), 2);
        assert_eq!(tm.tag_to_name(a).unwrap(), "title");
    }

    #[test]
    fn stale_client_state_is_typed() {
        let mut tm = TagsMatcher::new(1);
        tm.name_to_tag_mut("x");
        assert_eq!(
            tm.check_client_state(0, 2).unwrap_err().kind(),
            ErrorKind::StateInvalidated
        );
        assert_eq!(
            tm.check_client_state(0, 1).unwrap_err().kind(),
            ErrorKind::TagsMismatch
        );
        assert!(tm.check_client_state(1, 1).is_ok());
    }

    #[test]
    fn rebuild_restores_reverse_map() {
        let mut tm = TagsMatcher::new(9);
        tm.name_to_tag_mut("a");
        tm.name_to_tag_mut("b");
        let json = serde_json::to_string(&tm).unwrap();
        let mut restored: TagsMatcher = serde_json::from_str(&json).unwrap();
        restored.rebuild();
        assert_eq!(restored.name_to_tag("b"), Some(2));
    }
}
