//! Derived authorization views over one policy snapshot.
//!
//! The index is rebuilt whenever the store installs a new snapshot and is
//! never persisted.

use capgate_policy::{Capabilities, Mechanism, PolicyDocument, PolicyEntry, load_user};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Everything a user is allowed, with the group and role names it came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserAuthorization {
    /// Effective capabilities (entry grants plus role grants).
    pub capabilities: Capabilities,
    /// Groups listed on the entry.
    pub groups: Vec<String>,
    /// Roles listed on the entry or inherited through groups.
    pub roles: Vec<String>,
}

impl UserAuthorization {
    fn from_entry(doc: &PolicyDocument, entry: &PolicyEntry) -> Self {
        Self {
            capabilities: doc.expand_capabilities(entry),
            groups: entry.groups.clone(),
            roles: doc.effective_roles(entry),
        }
    }
}

/// `user_id` keyed view of the enabled entries.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationIndex {
    users: HashMap<String, UserAuthorization>,
}

impl AuthorizationIndex {
    /// Build from the document; `entries` are the enabled entries in priority order.
    ///
    /// When two enabled entries share a user id the first in priority order
    /// wins. Entries with an empty user id are reachable only through
    /// [`lookup`](Self::lookup).
    pub fn build(doc: &PolicyDocument, entries: &[PolicyEntry]) -> Self {
        let mut users = HashMap::with_capacity(entries.len());
        for entry in entries.iter().filter(|e| !e.user_id.is_empty()) {
            users
                .entry(entry.user_id.clone())
                .or_insert_with(|| UserAuthorization::from_entry(doc, entry));
        }
        Self { users }
    }

    /// Every known user mapped to its capabilities.
    pub fn user_to_capabilities(&self) -> BTreeMap<String, Capabilities> {
        self.users
            .iter()
            .map(|(user, auth)| (user.clone(), auth.capabilities.clone()))
            .collect()
    }

    /// Exact lookup by user id.
    #[inline]
    pub fn get(&self, user_id: &str) -> Option<&UserAuthorization> {
        self.users.get(user_id)
    }

    /// Number of indexed users.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether no user is indexed.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Look up by user id, falling back to matching a synthesized
    /// `domain,address,mechanism,credential` identifier against `entries`.
    pub fn lookup(
        &self,
        doc: &PolicyDocument,
        entries: &[PolicyEntry],
        user_id: &str,
    ) -> Option<UserAuthorization> {
        if let Some(found) = self.users.get(user_id) {
            return Some(found.clone());
        }
        let parts = load_user(user_id);
        let [domain, address, mechanism, credentials @ ..] = parts.as_slice() else {
            return None;
        };
        let mechanism: Mechanism = mechanism.parse().ok()?;
        entries
            .iter()
            .find(|e| e.matches(domain, address, mechanism, credentials))
            .map(|e| UserAuthorization::from_entry(doc, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capgate_policy::dump_user;
    use serde_json::json;

    fn doc() -> PolicyDocument {
        let mut doc = PolicyDocument::default();
        doc.set_roles(&json!({"admin": ["allow_auth_modifications"]}))
            .unwrap();
        doc.set_groups(&json!({"ops": ["admin"]})).unwrap();
        doc.allow.push(
            PolicyEntry::builder(Mechanism::Plain)
                .credential("pw")
                .user_id("agent1")
                .groups(["ops"])
                .capability("can_call_foo", None)
                .build()
                .unwrap(),
        );
        doc.allow.push(
            PolicyEntry::builder(Mechanism::Plain)
                .credential("/anon-.*/")
                .user_id("")
                .capability("can_read", None)
                .build()
                .unwrap(),
        );
        doc
    }

    #[test]
    fn test_index_expands_groups() {
        let doc = doc();
        let entries = doc.enabled_entries();
        let index = AuthorizationIndex::build(&doc, &entries);
        assert_eq!(index.len(), 1);
        let auth = index.get("agent1").unwrap();
        assert!(auth.capabilities.contains("can_call_foo"));
        assert!(auth.capabilities.contains("allow_auth_modifications"));
        assert_eq!(auth.groups, ["ops"]);
        assert_eq!(auth.roles, ["admin"]);
    }

    #[test]
    fn test_lookup_falls_back_to_tuple_match() {
        let doc = doc();
        let entries = doc.enabled_entries();
        let index = AuthorizationIndex::build(&doc, &entries);
        let synthesized = dump_user(&["vip", "10.0.0.1", "PLAIN", "anon-7"]);
        let auth = index.lookup(&doc, &entries, &synthesized).unwrap();
        assert!(auth.capabilities.contains("can_read"));
        assert!(index.lookup(&doc, &entries, "nobody").is_none());
    }

    #[test]
    fn test_user_to_capabilities_lists_known_users() {
        let doc = doc();
        let entries = doc.enabled_entries();
        let map = AuthorizationIndex::build(&doc, &entries).user_to_capabilities();
        assert_eq!(map.keys().collect::<Vec<_>>(), ["agent1"]);
    }
}
