//! Write-protected pub/sub topics.
//!
//! ```json
//! {"write-protect": [
//!     {"topic": "devices/actuators", "capabilities": ["can_actuate"]},
//!     {"topic": "/record/.*/", "capabilities": "can_record"}
//! ]}
//! ```
//!
//! A plain topic protects itself and every topic it prefixes; a `/regex/`
//! topic protects every topic it fully matches.

use crate::error::{AuthError, AuthResult};
use capgate_policy::comments::strip_comments;
use capgate_policy::{Capabilities, Pattern, PolicyError};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Deserialize)]
struct TopicsFile {
    #[serde(rename = "write-protect", default)]
    write_protect: Vec<TopicRule>,
}

#[derive(Deserialize)]
struct TopicRule {
    topic: String,
    capabilities: OneOrMany,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<OneOrMany> for Vec<String> {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

/// Parsed protected-topic rules.
#[derive(Debug, Clone, Default)]
pub struct ProtectedTopics {
    exact: BTreeMap<String, Vec<String>>,
    regexes: Vec<(Pattern, Vec<String>)>,
}

impl ProtectedTopics {
    /// Parse the file contents. Empty text means no protected topics.
    pub fn parse(text: &str, path: &str) -> Result<Self, PolicyError> {
        let stripped = strip_comments(text);
        if stripped.trim().is_empty() {
            return Ok(Self::default());
        }
        let file: TopicsFile =
            serde_json::from_str(&stripped).map_err(|e| PolicyError::Corrupt {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        let mut topics = Self::default();
        for rule in file.write_protect {
            topics.add(&rule.topic, rule.capabilities.into())?;
        }
        Ok(topics)
    }

    /// Protect `topic` with `capabilities`.
    pub fn add(&mut self, topic: &str, capabilities: Vec<String>) -> Result<(), PolicyError> {
        let pattern = Pattern::parse(topic)?;
        if pattern.is_regex() {
            self.regexes.push((pattern, capabilities));
        } else {
            self.exact.insert(topic.to_string(), capabilities);
        }
        Ok(())
    }

    /// Capabilities guarding `topic`: exact rule, then the longest
    /// prefix rule, then the first matching regex.
    pub fn required_for(&self, topic: &str) -> Option<&[String]> {
        if let Some(caps) = self.exact.get(topic) {
            return Some(caps);
        }
        let prefix = self
            .exact
            .iter()
            .filter(|(prefix, _)| topic.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len());
        if let Some((_, caps)) = prefix {
            return Some(caps);
        }
        self.regexes
            .iter()
            .find(|(pattern, _)| pattern.matches(topic))
            .map(|(_, caps)| caps.as_slice())
    }

    /// Every rule as `(topic text, required capabilities)`.
    pub fn rules(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.exact
            .iter()
            .map(|(t, c)| (t.as_str(), c.as_slice()))
            .chain(self.regexes.iter().map(|(p, c)| (p.as_str(), c.as_slice())))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.regexes.is_empty()
    }

    /// Topic rules a holder of `held` may publish to.
    pub fn publishable_by(&self, held: &Capabilities) -> Vec<String> {
        self.rules()
            .filter(|(_, required)| required.iter().any(|c| held.contains(c)))
            .map(|(topic, _)| topic.to_string())
            .collect()
    }

    /// Check a publish. Unprotected topics are open; protected ones need at
    /// least one of their capabilities.
    pub fn check_publish(&self, topic: &str, held: &Capabilities) -> AuthResult<()> {
        match self.required_for(topic) {
            Some(required) if !required.is_empty() && !required.iter().any(|c| held.contains(c)) => {
                Err(AuthError::TopicUnauthorized {
                    topic: topic.to_string(),
                    required: required.to_vec(),
                    provided: held.names().map(str::to_string).collect(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// The protected-topics file plus its current rules.
pub struct TopicStore {
    path: PathBuf,
    last_seen: Mutex<Option<SystemTime>>,
    current: RwLock<Arc<ProtectedTopics>>,
    changes: watch::Sender<u64>,
}

impl TopicStore {
    /// Load the file, creating it empty if absent.
    ///
    /// An unreadable file protects nothing until it is fixed.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let (changes, _) = watch::channel(0);
        let store = Self {
            path: path.as_ref().to_path_buf(),
            last_seen: Mutex::new(None),
            current: RwLock::new(Arc::new(ProtectedTopics::default())),
            changes,
        };
        store.reload();
        store
    }

    /// Current rules.
    #[inline]
    pub fn snapshot(&self) -> Arc<ProtectedTopics> {
        Arc::clone(&self.current.read())
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<ProtectedTopics, PolicyError> {
        if !self.path.exists() {
            fs::write(&self.path, "")?;
        }
        let text = fs::read_to_string(&self.path)?;
        ProtectedTopics::parse(&text, &self.path.display().to_string())
    }

    /// Re-read the file if it changed. A file that fails to parse keeps the
    /// previous rules. Returns whether new rules were installed.
    pub fn reload(&self) -> bool {
        let mut last_seen = self.last_seen.lock();
        let modified = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        if modified.is_some() && modified == *last_seen {
            return false;
        }
        let result = self.read();
        *last_seen = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        match result {
            Ok(topics) => {
                info!(path = %self.path.display(), "protected topics loaded");
                *self.current.write() = Arc::new(topics);
                self.changes.send_modify(|generation| *generation += 1);
                true
            }
            Err(err) => {
                error!(path = %self.path.display(), error = %err, "protected topics file invalid, keeping previous rules");
                false
            }
        }
    }
}
