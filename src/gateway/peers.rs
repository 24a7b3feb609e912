//! Connected peers, call routing and protected publish.

use super::frames::ServerFrame;
use crate::error::{AuthError, AuthResult};
use crate::propagate::{PeerInfo, PeerTransport};
use crate::rpc::CallContext;
use crate::service::AuthService;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

/// One authenticated session.
#[derive(Debug)]
pub struct PeerSession {
    pub identity: String,
    pub user_id: String,
    tx: mpsc::Sender<ServerFrame>,
    subscriptions: RwLock<Vec<String>>,
    publish_permissions: RwLock<Vec<String>>,
}

impl PeerSession {
    pub async fn send(&self, frame: ServerFrame) -> AuthResult<()> {
        self.tx.send(frame).await.map_err(|_| AuthError::UnreachablePeer {
            peer: self.identity.clone(),
            reason: "session closed".into(),
        })
    }

    pub fn subscribe(&self, prefix: impl Into<String>) {
        let prefix = prefix.into();
        let mut subs = self.subscriptions.write();
        if !subs.contains(&prefix) {
            subs.push(prefix);
        }
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions
            .read()
            .iter()
            .any(|prefix| topic.starts_with(prefix.as_str()))
    }

    /// Protected topic rules this session was last granted.
    pub fn publish_permissions(&self) -> Vec<String> {
        self.publish_permissions.read().clone()
    }
}

/// Every connected session plus calls awaiting an answer.
pub struct PeerTable {
    auth: Arc<AuthService>,
    sessions: DashMap<String, Arc<PeerSession>>,
    pending: DashMap<u64, oneshot::Sender<AuthResult<Value>>>,
    next_call: AtomicU64,
    call_timeout: Duration,
    joins: watch::Sender<u64>,
}

impl PeerTable {
    pub fn new(auth: Arc<AuthService>, call_timeout: Duration) -> Self {
        Self {
            auth,
            sessions: DashMap::new(),
            pending: DashMap::new(),
            next_call: AtomicU64::new(1),
            call_timeout,
            joins: watch::Sender::new(0),
        }
    }

    fn auth_identity(&self) -> &str {
        self.auth.state().identity()
    }

    /// Add a session. Identities are unique, and the service's own identity
    /// is reserved as both identity and user id.
    pub fn register(
        &self,
        identity: String,
        user_id: String,
        tx: mpsc::Sender<ServerFrame>,
    ) -> AuthResult<Arc<PeerSession>> {
        let reserved = self.auth_identity();
        if identity == reserved || user_id == reserved {
            return Err(AuthError::Protocol(format!("{reserved} is reserved")));
        }
        let session = Arc::new(PeerSession {
            identity: identity.clone(),
            user_id,
            tx,
            subscriptions: RwLock::new(Vec::new()),
            publish_permissions: RwLock::new(Vec::new()),
        });
        match self.sessions.entry(identity) {
            Entry::Occupied(e) => Err(AuthError::Protocol(format!(
                "identity {} is already connected",
                e.key()
            ))),
            Entry::Vacant(e) => {
                e.insert(Arc::clone(&session));
                info!(identity = %session.identity, user_id = %session.user_id, "peer connected");
                self.joins.send_modify(|n| *n += 1);
                Ok(session)
            }
        }
    }

    pub fn unregister(&self, identity: &str) {
        if self.sessions.remove(identity).is_some() {
            info!(identity = %identity, "peer disconnected");
        }
    }

    pub fn get(&self, identity: &str) -> Option<Arc<PeerSession>> {
        self.sessions.get(identity).map(|s| Arc::clone(s.value()))
    }

    fn session(&self, identity: &str) -> AuthResult<Arc<PeerSession>> {
        self.get(identity).ok_or_else(|| AuthError::UnreachablePeer {
            peer: identity.to_string(),
            reason: "not connected".into(),
        })
    }

    /// Route a call from the peer granted `caller` to the service or to
    /// another peer.
    pub async fn route_rpc(
        &self,
        caller: &str,
        peer: &str,
        method: &str,
        params: Value,
    ) -> AuthResult<Value> {
        if peer == self.auth_identity() {
            return self
                .auth
                .dispatcher()
                .call(CallContext::remote(caller), method, params)
                .await;
        }
        self.call_peer(peer, caller, method, params).await
    }

    async fn call_peer(&self, peer: &str, caller: &str, method: &str, params: Value) -> AuthResult<Value> {
        let session = self.session(peer)?;
        let id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let frame = ServerFrame::Call {
            id,
            caller: caller.to_string(),
            method: method.to_string(),
            params,
        };
        if let Err(err) = session.send(frame).await {
            self.pending.remove(&id);
            return Err(err);
        }
        let answer = tokio::time::timeout(self.call_timeout, rx).await;
        self.pending.remove(&id);
        match answer {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AuthError::UnreachablePeer {
                peer: peer.to_string(),
                reason: "call abandoned".into(),
            }),
            Err(_) => Err(AuthError::UnreachablePeer {
                peer: peer.to_string(),
                reason: format!("no answer within {:?}", self.call_timeout),
            }),
        }
    }

    /// Deliver the answer to a forwarded call.
    pub fn complete(&self, id: u64, result: AuthResult<Value>) {
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(result);
            }
            None => debug!(id, "answer for unknown or expired call"),
        }
    }

    /// Publish after checking protected topics. Returns how many sessions
    /// received the message.
    pub async fn publish(&self, sender: &PeerSession, topic: &str, message: Value) -> AuthResult<usize> {
        let held = self.auth.state().capabilities(&sender.user_id);
        self.auth.state().topics().snapshot().check_publish(topic, &held)?;

        let targets: Vec<Arc<PeerSession>> = self
            .sessions
            .iter()
            .filter(|s| s.is_subscribed(topic))
            .map(|s| Arc::clone(s.value()))
            .collect();
        let mut delivered = 0;
        for target in targets {
            let frame = ServerFrame::Message {
                topic: topic.to_string(),
                sender: sender.identity.clone(),
                message: message.clone(),
            };
            if target.send(frame).await.is_ok() {
                delivered += 1;
            }
        }
        debug!(topic = %topic, sender = %sender.identity, delivered, "published");
        Ok(delivered)
    }
}

#[async_trait]
impl PeerTransport for PeerTable {
    async fn peers(&self) -> Vec<PeerInfo> {
        self.sessions
            .iter()
            .map(|s| PeerInfo {
                identity: s.identity.clone(),
                user_id: s.user_id.clone(),
            })
            .collect()
    }

    async fn notify(&self, peer: &str, method: &str, params: Value) -> AuthResult<()> {
        self.session(peer)?
            .send(ServerFrame::Notify {
                method: method.to_string(),
                params,
            })
            .await
    }

    async fn call(&self, peer: &str, method: &str, params: Value) -> AuthResult<Value> {
        let caller = self.auth_identity().to_string();
        self.call_peer(peer, &caller, method, params).await
    }

    async fn set_publish_permissions(&self, peer: &str, topics: Vec<String>) -> AuthResult<()> {
        let session = self.session(peer)?;
        *session.publish_permissions.write() = topics.clone();
        session
            .send(ServerFrame::Notify {
                method: "pubsub.permissions".to_string(),
                params: Value::from(topics),
            })
            .await
    }

    fn joins(&self) -> Option<watch::Receiver<u64>> {
        Some(self.joins.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceState;
    use crate::store::PolicyStore;
    use crate::topics::TopicStore;
    use crate::triage::FailureTriageQueue;
    use capgate_policy::{EntryList, Mechanism, PolicyEntry};
    use serde_json::json;
    use tempfile::TempDir;

    fn table() -> (TempDir, Arc<PeerTable>) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("topics.json"),
            r#"{"write-protect": [{"topic": "devices", "capabilities": ["can_publish_devices"]}]}"#,
        )
        .unwrap();
        let store = Arc::new(PolicyStore::open(dir.path().join("auth.json")).unwrap());
        store
            .add(
                PolicyEntry::builder(Mechanism::Plain)
                    .credential("k1")
                    .user_id("driver")
                    .capability("can_publish_devices", None)
                    .build()
                    .unwrap(),
                EntryList::Allow,
                false,
            )
            .unwrap();
        let topics = Arc::new(TopicStore::open(dir.path().join("topics.json")));
        let triage = Arc::new(parking_lot::Mutex::new(FailureTriageQueue::new()));
        let auth = Arc::new(AuthService::new(ServiceState::new(
            "platform.auth",
            store,
            topics,
            triage,
        )));
        (dir, Arc::new(PeerTable::new(auth, Duration::from_secs(1))))
    }

    #[test]
    fn test_identities_are_unique() {
        let (_dir, peers) = table();
        let (tx, _rx) = mpsc::channel(4);
        peers.register("a".into(), "a".into(), tx.clone()).unwrap();
        let err = peers.register("a".into(), "b".into(), tx.clone()).unwrap_err();
        assert_eq!(err.error_code(), "protocol_error");
        assert!(peers.register("platform.auth".into(), "x".into(), tx).is_err());
    }

    #[tokio::test]
    async fn test_forwarded_call_completes() {
        let (_dir, peers) = table();
        let (tx, mut rx) = mpsc::channel(4);
        peers.register("weather".into(), "weather".into(), tx).unwrap();

        let answering = Arc::clone(&peers);
        tokio::spawn(async move {
            if let Some(ServerFrame::Call { id, caller, .. }) = rx.recv().await {
                assert_eq!(caller, "driver");
                answering.complete(id, Ok(json!(21)));
            }
        });
        let answer = peers
            .route_rpc("driver", "weather", "temperature", Value::Null)
            .await
            .unwrap();
        assert_eq!(answer, json!(21));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out() {
        let (_dir, peers) = table();
        let (tx, _rx) = mpsc::channel(4);
        peers.register("weather".into(), "weather".into(), tx).unwrap();
        let err = peers
            .route_rpc("driver", "weather", "temperature", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UnreachablePeer { .. }));
        assert!(peers.pending.is_empty());
    }

    #[tokio::test]
    async fn test_publish_checks_protected_topics() {
        let (_dir, peers) = table();
        let (tx_driver, _rx_driver) = mpsc::channel(4);
        let (tx_other, _rx_other) = mpsc::channel(4);
        let (tx_sub, mut rx_sub) = mpsc::channel(4);
        let driver = peers.register("driver".into(), "driver".into(), tx_driver).unwrap();
        let other = peers.register("other".into(), "other".into(), tx_other).unwrap();
        peers
            .register("listener".into(), "listener".into(), tx_sub)
            .unwrap()
            .subscribe("devices");

        let err = peers
            .publish(&other, "devices/campus/a", json!("x"))
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());

        let delivered = peers
            .publish(&driver, "devices/campus/a", json!({"temp": 20}))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert!(matches!(rx_sub.recv().await, Some(ServerFrame::Message { .. })));

        // unprotected topics are open to all
        assert_eq!(peers.publish(&other, "heartbeat/other", json!(1)).await.unwrap(), 0);
    }
}
