//! Test server management.
//!
//! Runs a capgate instance inside the test runtime, bound to an ephemeral
//! port, with its policy files in a temporary directory.

use capgate::config::Config;
use capgate::server::Server;
use std::path::PathBuf;
use tempfile::TempDir;

/// A test server instance.
pub struct TestServer {
    server: Option<Server>,
    dir: TempDir,
}

impl TestServer {
    /// Spawn a server whose policy file starts with `policy` and whose
    /// protected-topics file starts with `topics`.
    pub async fn spawn(policy: &str, topics: &str) -> anyhow::Result<Self> {
        Self::spawn_with(policy, topics, "").await
    }

    /// Like [`TestServer::spawn`], appending `extra` TOML to the config.
    pub async fn spawn_with(policy: &str, topics: &str, extra: &str) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let auth_file = dir.path().join("auth.json");
        let topics_file = dir.path().join("protected_topics.json");
        std::fs::write(&auth_file, policy)?;
        std::fs::write(&topics_file, topics)?;

        let config_content = format!(
            r#"
[server]
instance_name = "test"
identity = "platform.auth"
listen = "127.0.0.1:0"

[policy]
auth_file = "{}"
protected_topics_file = "{}"
reload_interval_secs = 1

[handshake]
max_backoff_secs = 1

[propagation]
startup_delay_secs = 0
peer_timeout_secs = 2
{}
"#,
            auth_file.display(),
            topics_file.display(),
            extra,
        );
        let config: Config = toml::from_str(&config_content)?;
        let server = Server::start(&config).await?;
        Ok(Self {
            server: Some(server),
            dir,
        })
    }

    /// Get the server address for connecting.
    pub fn address(&self) -> String {
        self.server().local_addr().to_string()
    }

    pub fn server(&self) -> &Server {
        self.server.as_ref().expect("server running")
    }

    /// Path of the policy file.
    pub fn auth_file(&self) -> PathBuf {
        self.dir.path().join("auth.json")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
    }
}
