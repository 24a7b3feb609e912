//! Trust for NULL-mechanism peers on the local host.
//!
//! A local socket peer presents its address as `localhost:UID:GID:PID`;
//! some transports only know the uid. A process registered as a running agent is admitted as that agent;
//! otherwise any process of the service's own OS user is admitted.

use dashmap::DashMap;

/// Process-id and OS-user resolution for local peers.
pub trait LocalTrust: Send + Sync {
    /// Agent uuid of a locally started agent process.
    fn agent_for_pid(&self, pid: u32) -> Option<String>;
    /// OS user id the service runs as.
    fn service_uid(&self) -> Option<u32>;
}

/// Credentials parsed from a local peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalPeer {
    pub uid: u32,
    pub gid: Option<u32>,
    pub pid: Option<u32>,
}

/// Parse `localhost:UID[:GID[:PID]]`.
pub fn parse_local_address(address: &str) -> Option<LocalPeer> {
    let rest = address.strip_prefix("localhost:")?;
    let parts = rest
        .split(':')
        .map(str::parse::<u32>)
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    match parts[..] {
        [uid] => Some(LocalPeer { uid, gid: None, pid: None }),
        [uid, gid] => Some(LocalPeer { uid, gid: Some(gid), pid: None }),
        [uid, gid, pid] => Some(LocalPeer { uid, gid: Some(gid), pid: Some(pid) }),
        _ => None,
    }
}

/// Registry of agent processes plus the current process owner.
#[derive(Debug, Default)]
pub struct ProcessTrust {
    uid: Option<u32>,
    agents: DashMap<u32, String>,
}

impl ProcessTrust {
    /// Trust the OS user owning this process.
    pub fn new() -> Self {
        Self {
            uid: current_uid(),
            agents: DashMap::new(),
        }
    }

    /// Trust an explicit OS user.
    pub fn with_uid(uid: Option<u32>) -> Self {
        Self {
            uid,
            agents: DashMap::new(),
        }
    }

    /// Record that `pid` runs agent `agent_uuid`.
    pub fn register_agent(&self, pid: u32, agent_uuid: impl Into<String>) {
        self.agents.insert(pid, agent_uuid.into());
    }

    pub fn unregister_agent(&self, pid: u32) {
        self.agents.remove(&pid);
    }
}

impl LocalTrust for ProcessTrust {
    fn agent_for_pid(&self, pid: u32) -> Option<String> {
        self.agents.get(&pid).map(|agent| agent.value().clone())
    }

    fn service_uid(&self) -> Option<u32> {
        self.uid
    }
}

#[cfg(unix)]
fn current_uid() -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self").map(|m| m.uid()).ok()
}

#[cfg(not(unix))]
fn current_uid() -> Option<u32> {
    None
}
