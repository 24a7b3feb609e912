//! Bookkeeping of rejected handshakes awaiting an administrator.
//!
//! Failures live only in memory and are lost on restart. The service
//! performs the policy-file side of approve/deny/delete; this module only
//! moves records between lists.

use capgate_policy::{Mechanism, PolicyEntry, PolicyError, literal_field};
use chrono::Utc;
use serde::Serialize;

/// One rejected attempt, counted across identical retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingFailure {
    pub domain: String,
    pub address: String,
    pub mechanism: Mechanism,
    pub credential: Option<String>,
    /// Fresh id assigned on the first attempt; becomes the entry's user id
    /// on approval.
    pub user_id: String,
    pub retries: u32,
    /// RFC 3339 time of the latest attempt.
    pub last_attempt: String,
}

impl PendingFailure {
    fn same_attempt(&self, domain: &str, address: &str, mechanism: Mechanism, credential: Option<&str>) -> bool {
        self.domain == domain
            && self.address == address
            && self.mechanism == mechanism
            && self.credential.as_deref() == credential
    }

    /// The entry that approving this failure adds to the policy.
    pub fn to_entry(&self, comment: &str) -> Result<PolicyEntry, PolicyError> {
        let mut builder = PolicyEntry::builder(self.mechanism)
            .domain(literal_field(&self.domain))
            .address(literal_field(&self.address))
            .user_id(self.user_id.clone())
            .comments(comment)
            .enabled(true);
        if let Some(credential) = &self.credential {
            builder = builder.credential(literal_field(credential));
        }
        builder.build()
    }
}

/// List a failure currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageState {
    Pending,
    Approved,
    Denied,
}

/// All three lists, as returned to administrators.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TriageSnapshot {
    pub pending: Vec<PendingFailure>,
    pub approved: Vec<PendingFailure>,
    pub denied: Vec<PendingFailure>,
}

/// Pending, approved and denied failures.
#[derive(Debug, Default)]
pub struct FailureTriageQueue {
    pending: Vec<PendingFailure>,
    approved: Vec<PendingFailure>,
    denied: Vec<PendingFailure>,
}

impl FailureTriageQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn list_mut(&mut self, state: TriageState) -> &mut Vec<PendingFailure> {
        match state {
            TriageState::Pending => &mut self.pending,
            TriageState::Approved => &mut self.approved,
            TriageState::Denied => &mut self.denied,
        }
    }

    /// Record a rejected attempt.
    ///
    /// An identical pending attempt has its retry count incremented;
    /// otherwise a new failure with a fresh user id is queued.
    pub fn record(
        &mut self,
        domain: &str,
        address: &str,
        mechanism: Mechanism,
        credential: Option<&str>,
    ) -> &PendingFailure {
        let now = Utc::now().to_rfc3339();
        let position = self
            .pending
            .iter()
            .position(|f| f.same_attempt(domain, address, mechanism, credential));
        let index = match position {
            Some(index) => {
                let failure = &mut self.pending[index];
                failure.retries += 1;
                failure.last_attempt = now;
                index
            }
            None => {
                self.pending.push(PendingFailure {
                    domain: domain.to_string(),
                    address: address.to_string(),
                    mechanism,
                    credential: credential.map(str::to_string),
                    user_id: uuid::Uuid::new_v4().to_string(),
                    retries: 1,
                    last_attempt: now,
                });
                self.pending.len() - 1
            }
        };
        &self.pending[index]
    }

    /// Where `user_id` currently sits.
    pub fn find(&self, user_id: &str) -> Option<(TriageState, &PendingFailure)> {
        [
            (TriageState::Pending, &self.pending),
            (TriageState::Approved, &self.approved),
            (TriageState::Denied, &self.denied),
        ]
        .into_iter()
        .find_map(|(state, list)| list.iter().find(|f| f.user_id == user_id).map(|f| (state, f)))
    }

    /// Remove `user_id` from whichever list holds it.
    pub fn take(&mut self, user_id: &str) -> Option<(TriageState, PendingFailure)> {
        let (state, _) = self.find(user_id)?;
        let list = self.list_mut(state);
        let index = list.iter().position(|f| f.user_id == user_id)?;
        Some((state, list.remove(index)))
    }

    /// Move `user_id` to `to`. Returns the state it left, if it was found.
    pub fn transition(&mut self, user_id: &str, to: TriageState) -> Option<TriageState> {
        let (from, failure) = self.take(user_id)?;
        self.list_mut(to).push(failure);
        Some(from)
    }

    /// Failures awaiting a decision, oldest first.
    pub fn pending(&self) -> &[PendingFailure] {
        &self.pending
    }

    /// Failures that were admitted.
    pub fn approved(&self) -> &[PendingFailure] {
        &self.approved
    }

    /// Failures that were refused.
    pub fn denied(&self) -> &[PendingFailure] {
        &self.denied
    }

    /// Copy of all three lists.
    pub fn list(&self) -> TriageSnapshot {
        TriageSnapshot {
            pending: self.pending.clone(),
            approved: self.approved.clone(),
            denied: self.denied.clone(),
        }
    }
}
