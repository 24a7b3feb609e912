//! The in-memory policy: allow and deny entries plus the group and role tables.
//!
//! Every operation here is pure. Persisting the result is the caller's job
//! (see [`PolicyFile`](crate::PolicyFile)).

use crate::capability::Capabilities;
use crate::entry::PolicyEntry;
use crate::error::PolicyError;
use serde_json::Value;
use std::collections::BTreeMap;

/// Group name to the roles it confers.
pub type Groups = BTreeMap<String, Vec<String>>;

/// Role name to the capability names it confers.
pub type Roles = BTreeMap<String, Vec<String>>;

/// Which entry list an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryList {
    /// Entries used for matching.
    #[default]
    Allow,
    /// Entries an administrator refused; stored, never matched.
    Deny,
}

/// Result of [`PolicyDocument::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Appended at the end of the list.
    Added,
    /// Replaced the conflicting entry at this index.
    Replaced(usize),
}

/// The whole policy as stored in the file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyDocument {
    /// Entries consulted by the authenticator.
    pub allow: Vec<PolicyEntry>,
    /// Refused entries.
    pub deny: Vec<PolicyEntry>,
    /// Group table.
    pub groups: Groups,
    /// Role table.
    pub roles: Roles,
}

impl PolicyDocument {
    /// Borrow one of the entry lists.
    pub fn entries(&self, list: EntryList) -> &[PolicyEntry] {
        match list {
            EntryList::Allow => &self.allow,
            EntryList::Deny => &self.deny,
        }
    }

    fn entries_mut(&mut self, list: EntryList) -> &mut Vec<PolicyEntry> {
        match list {
            EntryList::Allow => &mut self.allow,
            EntryList::Deny => &mut self.deny,
        }
    }

    /// Enabled allow entries in match priority order.
    ///
    /// Exact-credential entries precede regex-credential entries; the sort is
    /// stable so file order is kept within each class. Capabilities are
    /// expanded through roles and groups.
    pub fn enabled_entries(&self) -> Vec<PolicyEntry> {
        let mut entries: Vec<PolicyEntry> = self
            .allow
            .iter()
            .filter(|e| e.enabled)
            .map(|e| {
                let mut e = e.clone();
                e.capabilities = self.expand_capabilities(&e);
                e
            })
            .collect();
        entries.sort_by_key(PolicyEntry::has_regex_credential);
        entries
    }

    /// Find the first entry in `list` conflicting with `entry`.
    ///
    /// A shared `user_id` takes precedence over a shared match key at the
    /// same index.
    pub fn check_conflict(&self, entry: &PolicyEntry, list: EntryList) -> Result<(), PolicyError> {
        for (index, existing) in self.entries(list).iter().enumerate() {
            if existing.user_id == entry.user_id {
                return Err(PolicyError::DuplicateUserId {
                    user_id: entry.user_id.clone(),
                    index,
                });
            }
            if existing.same_match_key(entry) {
                return Err(PolicyError::DuplicateMatch {
                    indices: vec![index],
                });
            }
        }
        Ok(())
    }

    /// Add an entry, or replace the conflicting one when `overwrite` is set.
    pub fn add(
        &mut self,
        entry: PolicyEntry,
        list: EntryList,
        overwrite: bool,
    ) -> Result<AddOutcome, PolicyError> {
        match self.check_conflict(&entry, list) {
            Ok(()) => {
                self.entries_mut(list).push(entry);
                Ok(AddOutcome::Added)
            }
            Err(PolicyError::DuplicateUserId { index, .. }) if overwrite => {
                self.entries_mut(list)[index] = entry;
                Ok(AddOutcome::Replaced(index))
            }
            Err(PolicyError::DuplicateMatch { indices }) if overwrite => {
                let entries = self.entries_mut(list);
                for &index in &indices {
                    entries[index] = entry.clone();
                }
                Ok(AddOutcome::Replaced(indices[0]))
            }
            Err(err) => Err(err),
        }
    }

    /// Replace the entry at `index`.
    pub fn update_by_index(
        &mut self,
        entry: PolicyEntry,
        index: usize,
        list: EntryList,
    ) -> Result<(), PolicyError> {
        let entries = self.entries_mut(list);
        let len = entries.len();
        let slot = entries
            .get_mut(index)
            .ok_or(PolicyError::IndexOutOfRange { index, len })?;
        *slot = entry;
        Ok(())
    }

    /// Remove several entries at once.
    ///
    /// Indices are de-duplicated and validated up front, then removed highest
    /// first so earlier removals never shift later ones. On error nothing is
    /// removed.
    pub fn remove_by_indices(&mut self, indices: &[usize], list: EntryList) -> Result<(), PolicyError> {
        let entries = self.entries_mut(list);
        let len = entries.len();
        let mut indices = indices.to_vec();
        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices.dedup();
        if let Some(&index) = indices.iter().find(|&&i| i >= len) {
            return Err(PolicyError::IndexOutOfRange { index, len });
        }
        for index in indices {
            entries.remove(index);
        }
        Ok(())
    }

    /// Remove every entry whose credential text equals `credential`.
    ///
    /// Returns how many entries were removed.
    pub fn remove_by_credential(&mut self, credential: &str, list: EntryList) -> usize {
        let entries = self.entries_mut(list);
        let before = entries.len();
        entries.retain(|e| e.credential_str() != Some(credential));
        before - entries.len()
    }

    /// Entries whose credential text equals `credential`.
    pub fn find_by_credential(&self, credential: &str, list: EntryList) -> Vec<&PolicyEntry> {
        self.entries(list)
            .iter()
            .filter(|e| e.credential_str() == Some(credential))
            .collect()
    }

    /// Position and entry of the allow entry with this `user_id`.
    pub fn find_by_user_id(&self, user_id: &str) -> Option<(usize, &PolicyEntry)> {
        self.allow.iter().enumerate().find(|(_, e)| e.user_id == user_id)
    }

    /// Move every entry with `user_id` from one list to the other.
    ///
    /// An entry that already conflicts with the destination is dropped from
    /// the source without being copied. Returns whether anything moved.
    pub fn move_entry(&mut self, user_id: &str, to: EntryList) -> bool {
        let from = match to {
            EntryList::Allow => EntryList::Deny,
            EntryList::Deny => EntryList::Allow,
        };
        let (moving, staying): (Vec<_>, Vec<_>) = std::mem::take(self.entries_mut(from))
            .into_iter()
            .partition(|e| e.user_id == user_id);
        *self.entries_mut(from) = staying;
        let moved = !moving.is_empty();
        for entry in moving {
            if self.check_conflict(&entry, to).is_ok() {
                self.entries_mut(to).push(entry);
            } else {
                tracing::warn!(user_id = %user_id, "entry already present in target list, dropping duplicate");
            }
        }
        moved
    }

    /// Replace the group table from an untyped value.
    pub fn set_groups(&mut self, value: &Value) -> Result<(), PolicyError> {
        self.groups = name_table(value, "groups")?;
        Ok(())
    }

    /// Replace the role table from an untyped value.
    pub fn set_roles(&mut self, value: &Value) -> Result<(), PolicyError> {
        self.roles = name_table(value, "roles")?;
        Ok(())
    }

    /// The entry's own capabilities plus those implied by its roles and groups.
    ///
    /// Groups name roles and roles name capabilities; there is no deeper
    /// nesting. Role-derived capabilities are unconstrained and never replace
    /// a constrained grant written on the entry.
    pub fn expand_capabilities(&self, entry: &PolicyEntry) -> Capabilities {
        let mut caps = entry.capabilities.clone();
        let group_roles = entry
            .groups
            .iter()
            .filter_map(|g| self.groups.get(g))
            .flatten();
        for role in entry.roles.iter().chain(group_roles) {
            for cap in self.roles.get(role).into_iter().flatten() {
                caps.insert_if_absent(cap.as_str());
            }
        }
        caps
    }

    /// Roles held directly or through groups, in first-seen order.
    pub fn effective_roles(&self, entry: &PolicyEntry) -> Vec<String> {
        let mut roles: Vec<String> = Vec::new();
        let group_roles = entry
            .groups
            .iter()
            .filter_map(|g| self.groups.get(g))
            .flatten();
        for role in entry.roles.iter().chain(group_roles) {
            if !roles.contains(role) {
                roles.push(role.clone());
            }
        }
        roles
    }
}

fn name_table(value: &Value, what: &str) -> Result<BTreeMap<String, Vec<String>>, PolicyError> {
    let Value::Object(map) = value else {
        return Err(PolicyError::Validation(format!("{what} parameter must be an object")));
    };
    map.iter()
        .map(|(key, names)| {
            let names = names
                .as_array()
                .and_then(|items| {
                    items
                        .iter()
                        .map(|n| n.as_str().map(str::to_string))
                        .collect::<Option<Vec<_>>>()
                })
                .ok_or_else(|| {
                    PolicyError::Validation(format!(
                        "each value of the {what} object must be a list of names (bad key {key:?})"
                    ))
                })?;
            Ok((key.clone(), names))
        })
        .collect()
}
