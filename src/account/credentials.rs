//! Per-realm credential storage.

use std::collections::HashMap;

/// Username/password pair for one realm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// Realm-indexed credential cache.
///
/// Entries are added lazily on the first challenge for a realm and kept for
/// the whole session.
#[derive(Debug, Default)]
pub struct CredentialCache {
    entries: HashMap<String, Credential>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, realm: &str) -> Option<&Credential> {
        self.entries.get(realm)
    }

    pub fn store(&mut self, realm: impl Into<String>, credential: Credential) {
        self.entries.insert(realm.into(), credential);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
