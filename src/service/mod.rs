//! The authentication service.
//!
//! Owns the policy store, the protected topics and the failure triage
//! queue, and exports the administrative surface through its own
//! [`RpcDispatcher`]. Mutating calls are authorized by the same policy they
//! edit.

mod exports;

use crate::config::Config;
use crate::error::{AuthError, AuthResult};
use crate::index::UserAuthorization;
use crate::rpc::{CapabilityLookup, RpcDispatcher};
use crate::store::PolicyStore;
use crate::topics::TopicStore;
use crate::triage::{FailureTriageQueue, PendingFailure, TriageState};
use capgate_policy::{Capabilities, EntryList, PolicyError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Capability required for every policy mutation.
pub const ALLOW_AUTH_MODIFICATIONS: &str = "allow_auth_modifications";

/// Identities of platform processes whose entries are not edited or pushed
/// through the RPC allowance calls.
pub const PLATFORM_IDENTITIES: &[&str] = &[
    "control",
    "control.connection",
    "config.store",
    "platform.agent",
];

impl CapabilityLookup for PolicyStore {
    fn capabilities(&self, user_id: &str) -> Capabilities {
        self.snapshot()
            .authorizations(user_id)
            .map(|auth| auth.capabilities)
            .unwrap_or_default()
    }
}

/// State shared by the service and its exported methods.
pub struct ServiceState {
    identity: String,
    store: Arc<PolicyStore>,
    topics: Arc<TopicStore>,
    triage: Arc<Mutex<FailureTriageQueue>>,
}

impl ServiceState {
    pub fn new(
        identity: impl Into<String>,
        store: Arc<PolicyStore>,
        topics: Arc<TopicStore>,
        triage: Arc<Mutex<FailureTriageQueue>>,
    ) -> Self {
        Self {
            identity: identity.into(),
            store,
            topics,
            triage,
        }
    }

    /// The service's own peer identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn topics(&self) -> &Arc<TopicStore> {
        &self.topics
    }

    pub fn triage(&self) -> &Arc<Mutex<FailureTriageQueue>> {
        &self.triage
    }

    /// Whether `identity` belongs to a platform process.
    pub fn is_platform_identity(&self, identity: &str) -> bool {
        identity == self.identity || PLATFORM_IDENTITIES.contains(&identity)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn user_to_capabilities(&self) -> BTreeMap<String, Capabilities> {
        self.store.snapshot().index.user_to_capabilities()
    }

    /// Capabilities, groups and roles of a user id or synthesized identifier.
    pub fn authorizations(&self, user_id: &str) -> Option<UserAuthorization> {
        self.store.snapshot().authorizations(user_id)
    }

    /// Capabilities used for every authorization decision.
    pub fn capabilities(&self, user_id: &str) -> Capabilities {
        self.store.snapshot().capabilities(user_id)
    }

    pub fn groups(&self, user_id: &str) -> Vec<String> {
        self.authorizations(user_id)
            .map(|auth| auth.groups)
            .unwrap_or_default()
    }

    pub fn roles(&self, user_id: &str) -> Vec<String> {
        self.authorizations(user_id)
            .map(|auth| auth.roles)
            .unwrap_or_default()
    }

    /// Failures currently in `state`.
    pub fn failures(&self, state: TriageState) -> Vec<PendingFailure> {
        let triage = self.triage.lock();
        match state {
            TriageState::Pending => triage.pending().to_vec(),
            TriageState::Approved => triage.approved().to_vec(),
            TriageState::Denied => triage.denied().to_vec(),
        }
    }

    // ------------------------------------------------------------------
    // Failure triage
    // ------------------------------------------------------------------

    /// Admit a failed peer by adding an entry for it.
    ///
    /// A failure denied earlier is restored from the deny list when its
    /// entry is still there. Unknown ids are ignored.
    pub fn approve_failure(&self, user_id: &str) -> AuthResult<()> {
        let mut triage = self.triage.lock();
        let Some((state, failure)) = triage.find(user_id) else {
            warn!(user_id = %user_id, "no authorization failure to approve");
            return Ok(());
        };
        match state {
            TriageState::Approved => return Ok(()),
            TriageState::Pending | TriageState::Denied => {
                let entry = failure.to_entry("added via triage")?;
                self.store.mutate(|doc| {
                    if doc.move_entry(user_id, EntryList::Allow) {
                        return Ok(());
                    }
                    doc.add(entry, EntryList::Allow, false).map(|_| ())
                })?;
            }
        }
        triage.transition(user_id, TriageState::Approved);
        info!(user_id = %user_id, "authorization failure approved");
        Ok(())
    }

    /// Refuse a failed peer. Retracting an approval moves its entry to the
    /// deny list.
    pub fn deny_failure(&self, user_id: &str) -> AuthResult<()> {
        let mut triage = self.triage.lock();
        match triage.find(user_id).map(|(state, _)| state) {
            None => {
                warn!(user_id = %user_id, "no authorization failure to deny");
                return Ok(());
            }
            Some(TriageState::Denied) => return Ok(()),
            Some(TriageState::Approved) => {
                self.store
                    .mutate(|doc| Ok(doc.move_entry(user_id, EntryList::Deny)))?;
            }
            Some(TriageState::Pending) => {}
        }
        triage.transition(user_id, TriageState::Denied);
        info!(user_id = %user_id, "authorization failure denied");
        Ok(())
    }

    /// Forget a failure. Any entry created for it is removed from the policy.
    pub fn delete_failure(&self, user_id: &str) -> AuthResult<()> {
        let mut triage = self.triage.lock();
        let Some((state, _)) = triage.find(user_id) else {
            warn!(user_id = %user_id, "no authorization failure to delete");
            return Ok(());
        };
        if state != TriageState::Pending {
            self.store.mutate(|doc| {
                doc.allow.retain(|e| e.user_id != user_id);
                doc.deny.retain(|e| e.user_id != user_id);
                Ok(())
            })?;
        }
        triage.take(user_id);
        info!(user_id = %user_id, "authorization failure deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Per-identity RPC allowances
    // ------------------------------------------------------------------

    fn refuse_platform(&self, identity: &str) -> AuthResult<()> {
        if self.is_platform_identity(identity) {
            return Err(AuthError::InvalidParams(format!(
                "{identity} cannot be modified using this command"
            )));
        }
        Ok(())
    }

    /// Merge an agent's declared allowances into its entry.
    ///
    /// Methods missing from the entry, or present with no capabilities, take
    /// the declared list; otherwise the entry's list wins. Returns the
    /// effective map, or `None` when no entry carries `identity`.
    pub fn update_id_rpc_authorizations(
        &self,
        identity: &str,
        declared: BTreeMap<String, Vec<String>>,
    ) -> AuthResult<Option<BTreeMap<String, Vec<String>>>> {
        let snapshot = self.store.snapshot();
        let Some((_, current)) = snapshot
            .document
            .allow
            .iter()
            .enumerate()
            .find(|(_, e)| e.identity.as_deref() == Some(identity))
        else {
            return Ok(None);
        };

        let mut effective = BTreeMap::new();
        let mut changed = false;
        for (method, caps) in &declared {
            match current.rpc_method_authorizations.get(method) {
                Some(stored) if !stored.is_empty() => {
                    effective.insert(method.clone(), stored.clone());
                }
                _ => {
                    changed = true;
                    effective.insert(method.clone(), caps.clone());
                }
            }
        }
        if changed {
            self.edit_identity(identity, |methods| {
                for (method, caps) in &declared {
                    let slot = methods.entry(method.clone()).or_default();
                    if slot.is_empty() {
                        *slot = caps.clone();
                    }
                }
                Ok(())
            })?;
        }
        Ok(Some(effective))
    }

    /// Allow `capabilities` to call `method` on `identity`.
    pub fn add_rpc_authorizations(
        &self,
        identity: &str,
        method: &str,
        capabilities: Vec<String>,
    ) -> AuthResult<()> {
        self.refuse_platform(identity)?;
        self.edit_identity(identity, |methods| {
            let slot = methods.entry(method.to_string()).or_default();
            slot.retain(|c| !c.is_empty());
            for cap in capabilities {
                if !slot.contains(&cap) {
                    slot.push(cap);
                }
            }
            Ok(())
        })
    }

    /// Stop `capabilities` from calling `method` on `identity`.
    ///
    /// Removing the last capability leaves `[""]`, which no caller holds.
    pub fn delete_rpc_authorizations(
        &self,
        identity: &str,
        method: &str,
        capabilities: Vec<String>,
    ) -> AuthResult<()> {
        self.refuse_platform(identity)?;
        self.edit_identity(identity, |methods| {
            let slot = methods
                .get_mut(method)
                .filter(|caps| !caps.is_empty())
                .ok_or_else(|| {
                    PolicyError::Validation(format!(
                        "{identity}.{method} has no authorized capabilities"
                    ))
                })?;
            if !capabilities.iter().any(|c| slot.contains(c)) {
                return Err(PolicyError::Validation(format!(
                    "none of {capabilities:?} is authorized for {method}"
                )));
            }
            slot.retain(|c| !capabilities.contains(c));
            if slot.is_empty() {
                slot.push(String::new());
            }
            Ok(())
        })
    }

    fn edit_identity(
        &self,
        identity: &str,
        f: impl FnOnce(&mut BTreeMap<String, Vec<String>>) -> Result<(), PolicyError>,
    ) -> AuthResult<()> {
        self.store.mutate(|doc| {
            let entry = doc
                .allow
                .iter_mut()
                .find(|e| e.identity.as_deref() == Some(identity))
                .ok_or_else(|| {
                    PolicyError::Validation(format!("no entry with identity {identity}"))
                })?;
            f(&mut entry.rpc_method_authorizations)
        })?;
        info!(identity = %identity, "rpc method authorizations updated");
        Ok(())
    }
}

/// The service plus its exported methods.
pub struct AuthService {
    state: Arc<ServiceState>,
    dispatcher: Arc<RpcDispatcher>,
}

impl AuthService {
    /// Open the policy and protected-topic files named in `config`.
    pub fn open(config: &Config, triage: Arc<Mutex<FailureTriageQueue>>) -> AuthResult<Self> {
        let store = Arc::new(PolicyStore::open(&config.policy.auth_file)?);
        let topics = Arc::new(TopicStore::open(&config.policy.protected_topics_file));
        Ok(Self::new(ServiceState::new(
            config.server.identity.clone(),
            store,
            topics,
            triage,
        )))
    }

    pub fn new(state: ServiceState) -> Self {
        let state = Arc::new(state);
        let dispatcher = Arc::new(exports::build_dispatcher(&state));
        Self { state, dispatcher }
    }

    pub fn state(&self) -> &Arc<ServiceState> {
        &self.state
    }

    pub fn dispatcher(&self) -> &Arc<RpcDispatcher> {
        &self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capgate_policy::{Mechanism, PolicyEntry};
    use tempfile::TempDir;

    fn service() -> (TempDir, ServiceState) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PolicyStore::open(dir.path().join("auth.json")).unwrap());
        let topics = Arc::new(TopicStore::open(dir.path().join("topics.json")));
        let triage = Arc::new(Mutex::new(FailureTriageQueue::new()));
        (dir, ServiceState::new("platform.auth", store, topics, triage))
    }

    fn agent(identity: &str) -> PolicyEntry {
        PolicyEntry::builder(Mechanism::Plain)
            .credential(format!("{identity}-key"))
            .user_id(identity)
            .identity(identity)
            .rpc_method("status", ["can_status"])
            .rpc_method("reset", Vec::<String>::new())
            .build()
            .unwrap()
    }

    #[test]
    fn test_approve_then_deny_then_delete() {
        let (_dir, svc) = service();
        let id = svc
            .triage
            .lock()
            .record("", "1.2.3.4", Mechanism::Plain, Some("BADKEY"))
            .user_id
            .clone();

        svc.approve_failure(&id).unwrap();
        let snap = svc.store.snapshot();
        let (_, entry) = snap.document.find_by_user_id(&id).unwrap();
        assert_eq!(entry.credential_str(), Some("BADKEY"));
        assert!(entry.enabled);
        assert_eq!(svc.failures(TriageState::Approved).len(), 1);

        svc.deny_failure(&id).unwrap();
        let snap = svc.store.snapshot();
        assert!(snap.document.find_by_user_id(&id).is_none());
        assert_eq!(snap.document.deny.len(), 1);

        svc.approve_failure(&id).unwrap();
        assert!(svc.store.snapshot().document.find_by_user_id(&id).is_some());

        svc.delete_failure(&id).unwrap();
        let snap = svc.store.snapshot();
        assert!(snap.document.allow.is_empty());
        assert!(snap.document.deny.is_empty());
        assert!(svc.triage.lock().find(&id).is_none());
    }

    #[test]
    fn test_unknown_failure_is_noop() {
        let (_dir, svc) = service();
        svc.approve_failure("ghost").unwrap();
        svc.deny_failure("ghost").unwrap();
        assert!(svc.store.snapshot().document.allow.is_empty());
    }

    #[test]
    fn test_update_id_rpc_authorizations_prefers_file() {
        let (_dir, svc) = service();
        svc.store.add(agent("weather"), EntryList::Allow, false).unwrap();

        let declared = BTreeMap::from([
            ("status".to_string(), vec!["other".to_string()]),
            ("reset".to_string(), vec!["can_reset".to_string()]),
            ("new".to_string(), vec!["can_new".to_string()]),
        ]);
        let effective = svc
            .update_id_rpc_authorizations("weather", declared)
            .unwrap()
            .unwrap();
        assert_eq!(effective["status"], ["can_status"]);
        assert_eq!(effective["reset"], ["can_reset"]);
        assert_eq!(effective["new"], ["can_new"]);

        let snap = svc.store.snapshot();
        let (_, entry) = snap.document.find_by_user_id("weather").unwrap();
        assert_eq!(entry.rpc_method_authorizations["new"], ["can_new"]);
        assert!(
            svc.update_id_rpc_authorizations("nobody", BTreeMap::new())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_add_and_delete_rpc_authorizations() {
        let (_dir, svc) = service();
        svc.store.add(agent("weather"), EntryList::Allow, false).unwrap();

        svc.add_rpc_authorizations("weather", "status", vec!["can_admin".into()])
            .unwrap();
        svc.delete_rpc_authorizations(
            "weather",
            "status",
            vec!["can_status".into(), "can_admin".into()],
        )
        .unwrap();
        let snap = svc.store.snapshot();
        let (_, entry) = snap.document.find_by_user_id("weather").unwrap();
        assert_eq!(entry.rpc_method_authorizations["status"], [""]);

        let err = svc
            .add_rpc_authorizations("config.store", "x", vec!["c".into()])
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidParams(_)));
    }
}
