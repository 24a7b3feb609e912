//! Fan-out of policy changes to connected peers.
//!
//! After every installed policy or protected-topic change the propagator
//! pushes the `user_id -> capabilities` map to every peer, reconciles each
//! peer's publish permissions, and pushes changed RPC allowances to the peer
//! that owns them. Every peer operation is bounded by a timeout; an
//! unreachable peer is logged and skipped until the next pass, which runs on
//! the next change or the periodic resync at the latest.

use crate::config::PropagationConfig;
use crate::error::{AuthError, AuthResult};
use crate::rpc::builtin;
use crate::service::ServiceState;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A connected, authenticated peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Routing identity the peer declared.
    pub identity: String,
    /// User id granted at handshake.
    pub user_id: String,
}

/// What the propagator needs from the message bus.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Currently connected peers.
    async fn peers(&self) -> Vec<PeerInfo>;
    /// One-way message to `peer`.
    async fn notify(&self, peer: &str, method: &str, params: Value) -> AuthResult<()>;
    /// Call a method exported by `peer`, as the authentication service.
    async fn call(&self, peer: &str, method: &str, params: Value) -> AuthResult<Value>;
    /// Replace the topics `peer` may publish to.
    async fn set_publish_permissions(&self, peer: &str, topics: Vec<String>) -> AuthResult<()>;
    /// Signalled whenever a peer joins, if the transport tracks joins.
    fn joins(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}

/// Outcome of one propagation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationReport {
    /// Peers that received the capability map.
    pub notified: usize,
    /// Peers whose publish permissions were reconciled.
    pub permissions_set: usize,
    /// Identities that received RPC allowance updates.
    pub allowances_pushed: Vec<String>,
    /// Peers skipped because they failed or timed out.
    pub unreachable: Vec<String>,
}

type RpcAllowances = BTreeMap<String, Vec<String>>;

/// Pushes policy state to peers.
pub struct UpdatePropagator {
    state: Arc<ServiceState>,
    transport: Arc<dyn PeerTransport>,
    timeout: Duration,
    startup_delay: Duration,
    resync: Duration,
    /// Allowances last pushed, by identity.
    pushed: Mutex<HashMap<String, RpcAllowances>>,
}

impl UpdatePropagator {
    pub fn new(
        state: Arc<ServiceState>,
        transport: Arc<dyn PeerTransport>,
        config: &PropagationConfig,
    ) -> Self {
        Self {
            state,
            transport,
            timeout: config.peer_timeout(),
            startup_delay: config.startup_delay(),
            resync: config.resync_interval(),
            pushed: Mutex::new(HashMap::new()),
        }
    }

    async fn bounded<T>(&self, peer: &str, fut: impl Future<Output = AuthResult<T>>) -> AuthResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::UnreachablePeer {
                peer: peer.to_string(),
                reason: format!("no answer within {:?}", self.timeout),
            }),
        }
    }

    /// Run one full pass.
    pub async fn propagate(&self) -> PropagationReport {
        let snapshot = self.state.store().snapshot();
        let topics = self.state.topics().snapshot();
        let user_to_caps = snapshot.index.user_to_capabilities();
        let params = json!({ "user_to_caps": user_to_caps });
        let mut report = PropagationReport::default();

        let peers = self.transport.peers().await;
        for peer in peers.iter().filter(|p| p.identity != self.state.identity()) {
            let sent = self
                .bounded(&peer.identity, self.transport.notify(&peer.identity, builtin::UPDATE, params.clone()))
                .await;
            if let Err(err) = sent {
                warn!(peer = %peer.identity, error = %err, "capability update not delivered");
                report.unreachable.push(peer.identity.clone());
                continue;
            }
            report.notified += 1;

            // same lookup publish enforcement uses
            let allowed = topics.publishable_by(&snapshot.capabilities(&peer.user_id));
            match self
                .bounded(&peer.identity, self.transport.set_publish_permissions(&peer.identity, allowed))
                .await
            {
                Ok(()) => report.permissions_set += 1,
                // disconnected mid-pass
                Err(err) => debug!(peer = %peer.identity, error = %err, "publish permissions skipped"),
            }
        }

        self.push_rpc_allowances(&snapshot.document.allow, &peers, &mut report)
            .await;
        debug!(
            generation = snapshot.generation,
            notified = report.notified,
            unreachable = report.unreachable.len(),
            "propagation pass complete"
        );
        report
    }

    /// Allowances of connected owners that differ from what was last pushed.
    ///
    /// Owners that disconnected are forgotten so a reconnect gets a full push.
    /// Nothing is recorded here; see [`Self::mark_pushed`].
    fn changed_allowances(
        &self,
        entries: &[capgate_policy::PolicyEntry],
        peers: &[PeerInfo],
    ) -> Vec<(String, RpcAllowances)> {
        let mut pushed = self.pushed.lock();
        pushed.retain(|identity, _| peers.iter().any(|p| &p.identity == identity));
        let mut changed = Vec::new();
        for entry in entries {
            let Some(identity) = entry.identity.as_deref() else {
                continue;
            };
            if self.state.is_platform_identity(identity) {
                continue;
            }
            if !peers.iter().any(|p| p.identity == identity) {
                debug!(identity = %identity, "owner not connected, allowances pushed when it joins");
                continue;
            }
            if pushed.get(identity) == Some(&entry.rpc_method_authorizations) {
                continue;
            }
            changed.push((identity.to_string(), entry.rpc_method_authorizations.clone()));
        }
        changed
    }

    /// Remember what `identity` now holds so unchanged allowances are skipped.
    fn mark_pushed(&self, identity: &str, allowances: RpcAllowances) {
        self.pushed.lock().insert(identity.to_string(), allowances);
    }

    async fn push_rpc_allowances(
        &self,
        entries: &[capgate_policy::PolicyEntry],
        peers: &[PeerInfo],
        report: &mut PropagationReport,
    ) {
        for (identity, allowances) in self.changed_allowances(entries, peers) {
            let methods: RpcAllowances = allowances
                .iter()
                .filter(|(_, caps)| !caps.is_empty())
                .map(|(m, caps)| (m.clone(), caps.clone()))
                .collect();
            if methods.is_empty() {
                self.mark_pushed(&identity, allowances);
                continue;
            }
            let params = json!({ "rpc_authorizations": methods });
            let result = self
                .bounded(
                    &identity,
                    self.transport
                        .call(&identity, builtin::SET_MULTIPLE_RPC_AUTHORIZATIONS, params),
                )
                .await;
            match result {
                Ok(_) => {
                    self.mark_pushed(&identity, allowances);
                    report.allowances_pushed.push(identity);
                }
                Err(AuthError::Remote { .. }) => {
                    // some method is unknown to the peer; apply the rest one by one
                    let mut reachable = true;
                    for (method, caps) in &methods {
                        let params = json!({ "method_str": method, "capabilities": caps });
                        let single = self
                            .bounded(
                                &identity,
                                self.transport
                                    .call(&identity, builtin::SET_RPC_AUTHORIZATIONS, params),
                            )
                            .await;
                        match single {
                            Ok(_) => {}
                            Err(err @ AuthError::Remote { .. }) => {
                                warn!(identity = %identity, method = %method, error = %err, "rpc allowance refused by peer");
                            }
                            Err(err) => {
                                error!(identity = %identity, method = %method, error = %err, "rpc allowance not applied");
                                reachable = false;
                                break;
                            }
                        }
                    }
                    if reachable {
                        self.mark_pushed(&identity, allowances);
                        report.allowances_pushed.push(identity);
                    } else {
                        report.unreachable.push(identity);
                    }
                }
                Err(err) => {
                    error!(identity = %identity, error = %err, "rpc allowance update failed, retried on the next pass");
                    report.unreachable.push(identity);
                }
            }
        }
    }

    /// Wait out the startup delay, push once, then push after every change,
    /// every peer join, and every resync interval.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut policy = self.state.store().subscribe();
            let mut topics = self.state.topics().subscribe();
            let mut joins = self.transport.joins();
            tokio::time::sleep(self.startup_delay).await;
            let mut resync = tokio::time::interval(self.resync);
            resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                policy.borrow_and_update();
                topics.borrow_and_update();
                if let Some(joins) = joins.as_mut() {
                    joins.borrow_and_update();
                }
                resync.reset();
                let report = self.propagate().await;
                info!(
                    notified = report.notified,
                    unreachable = report.unreachable.len(),
                    "policy propagated to peers"
                );
                let joined = async {
                    match joins.as_mut() {
                        Some(joins) => joins.changed().await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    changed = policy.changed() => if changed.is_err() { break },
                    changed = topics.changed() => if changed.is_err() { break },
                    changed = joined => if changed.is_err() { break },
                    _ = resync.tick() => debug!("periodic resync"),
                }
            }
            debug!("propagator stopped");
        })
    }
}
