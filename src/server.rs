//! Process assembly: opens the policy, starts the background tasks, and
//! binds the gateway.

use crate::config::Config;
use crate::gateway::{Gateway, PeerTable};
use crate::handshake::{Authenticator, ProcessTrust, spawn_handshake_loop};
use crate::propagate::UpdatePropagator;
use crate::reload::{spawn_file_watcher, spawn_reload_task};
use crate::service::AuthService;
use crate::triage::FailureTriageQueue;
use notify::RecommendedWatcher;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Handshakes waiting for the handshake loop.
const HANDSHAKE_QUEUE: usize = 128;

/// A running instance.
pub struct Server {
    local_addr: SocketAddr,
    auth: Arc<AuthService>,
    peers: Arc<PeerTable>,
    trust: Arc<ProcessTrust>,
    /// Kept alive for as long as the server runs.
    watcher: Option<RecommendedWatcher>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Open everything named in `config` and start serving.
    pub async fn start(config: &Config) -> anyhow::Result<Self> {
        let triage = Arc::new(Mutex::new(FailureTriageQueue::new()));
        let auth = Arc::new(AuthService::open(config, Arc::clone(&triage))?);
        let state = Arc::clone(auth.state());
        let trust = Arc::new(ProcessTrust::new());
        let authenticator = Arc::new(Authenticator::new(
            Arc::clone(state.store()),
            triage,
            trust.clone(),
            &config.handshake,
        ));

        let mut tasks = Vec::new();
        let (handshake_tx, handshake_rx) = mpsc::channel(HANDSHAKE_QUEUE);
        tasks.push(spawn_handshake_loop(authenticator, handshake_rx));
        info!("handshake loop started");

        let peers = Arc::new(PeerTable::new(
            Arc::clone(&auth),
            config.propagation.peer_timeout(),
        ));
        let propagator = Arc::new(UpdatePropagator::new(
            Arc::clone(&state),
            peers.clone(),
            &config.propagation,
        ));
        tasks.push(propagator.spawn());
        info!(delay = ?config.propagation.startup_delay(), "update propagation started");

        tasks.push(spawn_reload_task(Arc::clone(&state), config.policy.reload_interval()));
        info!(interval = ?config.policy.reload_interval(), "policy reload task started");
        let watcher = if config.policy.watch_files {
            match spawn_file_watcher(Arc::clone(&state)) {
                Ok((watcher, task)) => {
                    tasks.push(task);
                    Some(watcher)
                }
                Err(e) => {
                    warn!(error = %e, "file watcher unavailable, relying on periodic reload");
                    None
                }
            }
        } else {
            None
        };

        let gateway = Gateway::bind(config.server.listen, Arc::clone(&peers), handshake_tx).await?;
        let local_addr = gateway.local_addr()?;
        tasks.push(tokio::spawn(async move {
            if let Err(e) = gateway.run().await {
                error!(error = %e, "gateway stopped");
            }
        }));

        info!(
            instance = %config.server.instance_name,
            identity = %config.server.identity,
            addr = %local_addr,
            "capgate started"
        );
        Ok(Self {
            local_addr,
            auth,
            peers,
            trust,
            watcher,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn auth(&self) -> &Arc<AuthService> {
        &self.auth
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    /// Registry of locally trusted agent processes.
    pub fn trust(&self) -> &Arc<ProcessTrust> {
        &self.trust
    }

    /// Stop every task. Open sessions are dropped with the runtime.
    pub fn shutdown(self) {
        drop(self.watcher);
        for task in self.tasks {
            task.abort();
        }
        info!("capgate stopped");
    }
}
