//! Connection handshake authentication.
//!
//! The transport hands each attempt to the handshake loop as a
//! [`HandshakeRequest`] with a reply channel. Every attempt moves through
//! [`HandshakeState`]: it is matched against the current policy snapshot,
//! then granted, rejected as malformed, or denied. Denials are recorded for
//! triage and answered only after a per-address backoff delay.

mod backoff;
mod trust;

pub use backoff::Backoff;
pub use trust::{LocalPeer, LocalTrust, ProcessTrust, parse_local_address};

use crate::config::HandshakeConfig;
use crate::store::PolicyStore;
use crate::telemetry::credential_prefix;
use crate::triage::FailureTriageQueue;
use capgate_policy::{EntryList, Mechanism, PolicyEntry, dump_user, literal_field};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Mechanism recorded in identifiers of locally trusted agent processes.
const AGENT_MECHANISM: &str = "AGENT";

/// A handshake attempt as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    #[serde(default)]
    pub domain: String,
    pub address: String,
    pub mechanism: String,
    #[serde(default)]
    pub credentials: Vec<String>,
}

/// Per-attempt state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingRequest,
    Matching,
    Granted,
    /// Malformed request; not recorded as a failure.
    DeniedSoft,
    /// Valid request that no rule admits.
    DeniedHard,
}

/// Decision for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Granted { user_id: String },
    Rejected { reason: String },
    Denied { user_id: String, delay: Duration },
}

impl HandshakeOutcome {
    /// Terminal state reached.
    pub fn state(&self) -> HandshakeState {
        match self {
            Self::Granted { .. } => HandshakeState::Granted,
            Self::Rejected { .. } => HandshakeState::DeniedSoft,
            Self::Denied { .. } => HandshakeState::DeniedHard,
        }
    }
}

/// Reply sent back over the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeResponse {
    Granted { user_id: String },
    Denied { reason: String },
}

/// Attempt plus the channel its reply goes to.
pub type HandshakeJob = (HandshakeRequest, oneshot::Sender<HandshakeResponse>);

/// Decides handshakes against the live policy.
pub struct Authenticator {
    store: Arc<PolicyStore>,
    triage: Arc<Mutex<FailureTriageQueue>>,
    trust: Arc<dyn LocalTrust>,
    backoff: Mutex<Backoff>,
    allow_any: bool,
    setup_mode: bool,
}

impl Authenticator {
    pub fn new(
        store: Arc<PolicyStore>,
        triage: Arc<Mutex<FailureTriageQueue>>,
        trust: Arc<dyn LocalTrust>,
        config: &HandshakeConfig,
    ) -> Self {
        if config.allow_any {
            warn!("handshake.allow_any is set: every unmatched peer will be admitted");
        }
        if config.setup_mode {
            warn!("handshake.setup_mode is set: unmatched peers will be enrolled");
        }
        Self {
            store,
            triage,
            trust,
            backoff: Mutex::new(Backoff::new(Duration::from_secs(config.max_backoff_secs))),
            allow_any: config.allow_any,
            setup_mode: config.setup_mode,
        }
    }

    /// Decide one attempt.
    pub fn authenticate(&self, request: &HandshakeRequest) -> HandshakeOutcome {
        let HandshakeRequest {
            domain,
            address,
            mechanism,
            credentials,
        } = request;
        let mechanism: Mechanism = match mechanism.parse() {
            Ok(m) => m,
            Err(err) => {
                warn!(address = %address, error = %err, "malformed handshake rejected");
                return HandshakeOutcome::Rejected {
                    reason: err.to_string(),
                };
            }
        };
        if mechanism != Mechanism::Null && credentials.is_empty() {
            warn!(address = %address, mechanism = %mechanism, "handshake without credentials rejected");
            return HandshakeOutcome::Rejected {
                reason: format!("{mechanism} handshake requires credentials"),
            };
        }
        debug!(address = %address, state = ?HandshakeState::Matching, "matching handshake");

        let credential = credentials.first().map(String::as_str);
        let shown = credential_prefix(mechanism, credential);
        if let Some(user_id) = self.resolve(domain, address, mechanism, credentials) {
            info!(
                user_id = %user_id,
                domain = %domain,
                address = %address,
                mechanism = %mechanism,
                credential = %shown,
                "authentication success"
            );
            return HandshakeOutcome::Granted { user_id };
        }

        if self.setup_mode {
            match self.enroll(domain, address, mechanism, credential) {
                Ok(user_id) => {
                    info!(
                        user_id = %user_id,
                        domain = %domain,
                        address = %address,
                        mechanism = %mechanism,
                        credential = %shown,
                        "new entry added in setup mode"
                    );
                    return HandshakeOutcome::Granted { user_id };
                }
                Err(err) => warn!(address = %address, error = %err, "setup mode enrollment failed"),
            }
        }

        let (user_id, retries) = {
            let mut triage = self.triage.lock();
            let failure = triage.record(domain, address, mechanism, credential);
            (failure.user_id.clone(), failure.retries)
        };
        let delay = self.backoff.lock().next_delay(address, Instant::now());
        info!(
            user_id = %user_id,
            domain = %domain,
            address = %address,
            mechanism = %mechanism,
            credential = %shown,
            retries,
            delay_ms = delay.as_millis() as u64,
            "authentication failure"
        );
        HandshakeOutcome::Denied { user_id, delay }
    }

    fn resolve(
        &self,
        domain: &str,
        address: &str,
        mechanism: Mechanism,
        credentials: &[String],
    ) -> Option<String> {
        let snapshot = self.store.snapshot();
        let synthesized = || {
            let mut parts = vec![domain, address, mechanism.as_str()];
            parts.extend(credentials.first().map(String::as_str));
            dump_user(&parts)
        };
        if let Some(entry) = snapshot.find_match(domain, address, mechanism, credentials) {
            return Some(if entry.user_id.is_empty() {
                synthesized()
            } else {
                entry.user_id.clone()
            });
        }
        if mechanism == Mechanism::Null
            && let Some(peer) = parse_local_address(address)
        {
            if let Some(pid) = peer.pid
                && let Some(agent) = self.trust.agent_for_pid(pid)
            {
                debug!(pid, agent = %agent, "local agent process trusted");
                return Some(dump_user(&[domain, address, AGENT_MECHANISM, agent.as_str()]));
            }
            if self.trust.service_uid() == Some(peer.uid) {
                debug!(uid = peer.uid, "local process of service user trusted");
                return Some(synthesized());
            }
        }
        if self.allow_any {
            warn!(address = %address, mechanism = %mechanism, "INSECURE: admitting unmatched peer (allow_any)");
            return Some(synthesized());
        }
        None
    }

    fn enroll(
        &self,
        domain: &str,
        address: &str,
        mechanism: Mechanism,
        credential: Option<&str>,
    ) -> Result<String, capgate_policy::PolicyError> {
        let user_id = uuid::Uuid::new_v4().to_string();
        let mut builder = PolicyEntry::builder(mechanism)
            .domain(literal_field(domain))
            .address(literal_field(address))
            .user_id(user_id.clone())
            .comments("added in setup mode");
        if let Some(credential) = credential {
            builder = builder.credential(literal_field(credential));
        }
        self.store.add(builder.build()?, EntryList::Allow, false)?;
        Ok(user_id)
    }
}

/// Run the handshake loop until the request channel closes.
///
/// Grants and protocol rejections are answered at once; denials are
/// answered after their backoff delay without holding up later requests.
pub fn spawn_handshake_loop(
    authenticator: Arc<Authenticator>,
    mut requests: mpsc::Receiver<HandshakeJob>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(state = ?HandshakeState::AwaitingRequest, "handshake loop started");
        while let Some((request, reply)) = requests.recv().await {
            match authenticator.authenticate(&request) {
                HandshakeOutcome::Granted { user_id } => {
                    let _ = reply.send(HandshakeResponse::Granted { user_id });
                }
                HandshakeOutcome::Rejected { reason } => {
                    let _ = reply.send(HandshakeResponse::Denied { reason });
                }
                HandshakeOutcome::Denied { delay, .. } => {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = reply.send(HandshakeResponse::Denied {
                            reason: "authentication failed".to_string(),
                        });
                    });
                }
            }
        }
        debug!("handshake request channel closed");
    })
}
