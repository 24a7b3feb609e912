//! Shared, hot-reloadable policy.
//!
//! Readers take an immutable [`PolicySnapshot`] and never wait on file I/O.
//! Mutations and reloads serialize through one writer lock, perform the full
//! read-modify-write cycle on the file, and only then install a new snapshot
//! and bump the change generation watched by the propagator.

use crate::index::{AuthorizationIndex, UserAuthorization};
use capgate_policy::{
    AddOutcome, Capabilities, EntryList, Mechanism, PolicyDocument, PolicyEntry, PolicyError,
    PolicyFile,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// One installed version of the policy and everything derived from it.
#[derive(Debug, Default)]
pub struct PolicySnapshot {
    /// The document as last read or written.
    pub document: PolicyDocument,
    /// Enabled allow entries in match priority order, capabilities expanded.
    pub entries: Vec<PolicyEntry>,
    /// Per-user view of `entries`.
    pub index: AuthorizationIndex,
    /// Incremented on every install.
    pub generation: u64,
}

impl PolicySnapshot {
    fn build(document: PolicyDocument, generation: u64) -> Self {
        let entries = document.enabled_entries();
        let index = AuthorizationIndex::build(&document, &entries);
        Self {
            document,
            entries,
            index,
            generation,
        }
    }

    /// First enabled entry matching the attempt, in priority order.
    pub fn find_match<S: AsRef<str>>(
        &self,
        domain: &str,
        address: &str,
        mechanism: Mechanism,
        credentials: &[S],
    ) -> Option<&PolicyEntry> {
        self.entries
            .iter()
            .find(|e| e.matches(domain, address, mechanism, credentials))
    }

    /// Capabilities, groups and roles of a user id or synthesized identifier.
    pub fn authorizations(&self, user_id: &str) -> Option<UserAuthorization> {
        self.index.lookup(&self.document, &self.entries, user_id)
    }

    /// Capabilities of a user id or synthesized identifier; unknown users
    /// have none.
    pub fn capabilities(&self, user_id: &str) -> Capabilities {
        self.authorizations(user_id)
            .map(|auth| auth.capabilities)
            .unwrap_or_default()
    }
}

/// The policy file plus its current snapshot.
pub struct PolicyStore {
    file: PolicyFile,
    /// Writer lock; holds the modification time of the last read or write.
    writer: Mutex<Option<SystemTime>>,
    current: RwLock<Arc<PolicySnapshot>>,
    changes: watch::Sender<u64>,
}

impl PolicyStore {
    /// Open the policy file, creating it if absent.
    ///
    /// A corrupt file installs an empty policy, which rejects every peer.
    /// A file written by a newer version is fatal.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let file = PolicyFile::new(path.as_ref());
        let document = match file.read() {
            Ok(doc) => doc,
            Err(err @ PolicyError::Corrupt { .. }) => {
                error!(error = %err, "policy file unreadable, continuing with empty policy");
                PolicyDocument::default()
            }
            Err(err) => return Err(err),
        };
        let modified = file.modified();
        let snapshot = PolicySnapshot::build(document, 0);
        info!(
            path = %file.path().display(),
            entries = snapshot.entries.len(),
            users = snapshot.index.len(),
            "policy loaded"
        );
        let (changes, _) = watch::channel(0);
        Ok(Self {
            file,
            writer: Mutex::new(modified),
            current: RwLock::new(Arc::new(snapshot)),
            changes,
        })
    }

    /// The currently installed snapshot.
    #[inline]
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Receiver notified with the new generation after every install.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    fn install(&self, document: PolicyDocument) -> u64 {
        let mut current = self.current.write();
        let generation = current.generation + 1;
        *current = Arc::new(PolicySnapshot::build(document, generation));
        drop(current);
        self.changes.send_replace(generation);
        generation
    }

    /// Apply `f` to a fresh read of the file and write the result back.
    ///
    /// Nothing is written or installed when `f` fails, so a rejected
    /// mutation leaves the file untouched.
    pub fn mutate<T>(
        &self,
        f: impl FnOnce(&mut PolicyDocument) -> Result<T, PolicyError>,
    ) -> Result<T, PolicyError> {
        let mut last_seen = self.writer.lock();
        let mut document = self.file.read()?;
        let out = f(&mut document)?;
        self.file.write(&document)?;
        *last_seen = self.file.modified();
        let generation = self.install(document);
        debug!(generation, "policy mutated");
        Ok(out)
    }

    /// Re-read the file if its modification time changed.
    ///
    /// Returns whether a new snapshot was installed. A corrupt file installs
    /// an empty policy; a newer-version file is reported and the previous
    /// snapshot kept.
    pub fn reload(&self) -> Result<bool, PolicyError> {
        let mut last_seen = self.writer.lock();
        let modified = self.file.modified();
        if modified.is_some() && modified == *last_seen {
            return Ok(false);
        }
        let document = match self.file.read() {
            Ok(doc) => doc,
            Err(err @ PolicyError::Corrupt { .. }) => {
                error!(error = %err, "policy file unreadable, rejecting all peers until fixed");
                PolicyDocument::default()
            }
            Err(err) => return Err(err),
        };
        // read() may have created or upgraded the file
        *last_seen = self.file.modified();
        let generation = self.install(document);
        info!(generation, "policy reloaded from disk");
        Ok(true)
    }

    /// Add an entry; see [`PolicyDocument::add`].
    pub fn add(
        &self,
        entry: PolicyEntry,
        list: EntryList,
        overwrite: bool,
    ) -> Result<AddOutcome, PolicyError> {
        self.mutate(|doc| doc.add(entry, list, overwrite))
    }

    /// Replace the entry at `index`; see [`PolicyDocument::update_by_index`].
    pub fn update_by_index(
        &self,
        entry: PolicyEntry,
        index: usize,
        list: EntryList,
    ) -> Result<(), PolicyError> {
        self.mutate(|doc| doc.update_by_index(entry, index, list))
    }

    /// Remove several entries in one write.
    pub fn remove_by_indices(&self, indices: &[usize], list: EntryList) -> Result<(), PolicyError> {
        self.mutate(|doc| doc.remove_by_indices(indices, list))
    }

    /// Remove entries by credential text; returns how many were removed.
    pub fn remove_by_credential(&self, credential: &str, list: EntryList) -> Result<usize, PolicyError> {
        self.mutate(|doc| Ok(doc.remove_by_credential(credential, list)))
    }

    /// Replace the group table.
    pub fn set_groups(&self, groups: &Value) -> Result<(), PolicyError> {
        self.mutate(|doc| doc.set_groups(groups))
    }

    /// Replace the role table.
    pub fn set_roles(&self, roles: &Value) -> Result<(), PolicyError> {
        self.mutate(|doc| doc.set_roles(roles))
    }
}
