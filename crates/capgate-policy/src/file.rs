//! The versioned policy file.
//!
//! ```json
//! {
//!   "allow": [ { "mechanism": "CURVE", "credential": "...", "user_id": "agent1" } ],
//!   "deny": [],
//!   "groups": { "ops": ["admin"] },
//!   "roles": { "admin": ["allow_auth_modifications"] },
//!   "version": { "major": 1, "minor": 3 }
//! }
//! ```
//!
//! Comments (`#`, `//`, `/* */`) are allowed outside strings. Older files are
//! upgraded in place after a backup copy is written next to them.

use crate::comments::strip_comments;
use crate::document::{Groups, PolicyDocument, Roles};
use crate::entry::PolicyEntry;
use crate::error::PolicyError;
use crate::upgrade::upgrade_entries;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Schema version stored in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyVersion {
    /// Major version; a newer major is never read.
    pub major: u64,
    /// Minor version.
    pub minor: u64,
}

impl PolicyVersion {
    /// Construct a version.
    pub const fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for PolicyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Version written by this build.
pub const CURRENT_VERSION: PolicyVersion = PolicyVersion::new(1, 3);

/// Handle to a policy file on disk.
#[derive(Debug, Clone)]
pub struct PolicyFile {
    path: PathBuf,
}

impl PolicyFile {
    /// Refer to the file at `path`; nothing is read until [`read`](Self::read).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last modification time, if the file exists.
    pub fn modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    /// Read the file, creating it empty if absent and upgrading it if old.
    ///
    /// Entries that fail validation are skipped with a warning so one bad
    /// hand edit does not lock every peer out.
    pub fn read(&self) -> Result<PolicyDocument, PolicyError> {
        if !self.path.exists() {
            File::create(&self.path)?;
            info!(path = %self.path.display(), "created empty policy file");
        }
        let text = fs::read_to_string(&self.path)?;
        let stripped = strip_comments(&text);
        if stripped.trim().is_empty() {
            return Ok(PolicyDocument::default());
        }

        let raw: Value = serde_json::from_str(&stripped).map_err(|e| self.corrupt(e))?;
        let Value::Object(mut root) = raw else {
            return Err(self.corrupt("top level must be an object"));
        };

        let version = match root.remove("version") {
            Some(v) => serde_json::from_value(v).map_err(|e| self.corrupt(e))?,
            None => PolicyVersion::new(0, 0),
        };
        if version > CURRENT_VERSION {
            return Err(PolicyError::VersionUnsupported {
                major: version.major,
                minor: version.minor,
                supported: CURRENT_VERSION.to_string(),
            });
        }

        let mut allow = take_list(&mut root, "allow");
        let mut deny = take_list(&mut root, "deny");
        let upgrading = version < CURRENT_VERSION;
        if upgrading {
            let backup = self.backup()?;
            info!(
                path = %self.path.display(),
                backup = %backup.display(),
                from = %version,
                to = %CURRENT_VERSION,
                "upgrading policy file"
            );
            allow = upgrade_entries(allow, version, &self.path.display().to_string());
            deny = upgrade_entries(deny, version, &self.path.display().to_string());
        }

        let mut doc = PolicyDocument {
            allow: self.parse_entries(allow),
            deny: self.parse_entries(deny),
            ..PolicyDocument::default()
        };
        if let Some(groups) = root.get("groups") {
            doc.set_groups(groups).map_err(|e| self.corrupt(e))?;
        }
        if let Some(roles) = root.get("roles") {
            doc.set_roles(roles).map_err(|e| self.corrupt(e))?;
        }

        if upgrading {
            self.write(&doc)?;
        }
        Ok(doc)
    }

    /// Replace the file's contents with `doc` at the current version.
    ///
    /// Writes a sibling temp file and renames it over the original, so a
    /// concurrent reader sees either the old or the new policy.
    pub fn write(&self, doc: &PolicyDocument) -> Result<(), PolicyError> {
        let image = FileImage {
            allow: &doc.allow,
            deny: &doc.deny,
            groups: &doc.groups,
            roles: &doc.roles,
            version: CURRENT_VERSION,
        };

        let temp_path = self.sibling("tmp");
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        serde_json::to_writer_pretty(&mut writer, &image)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, &self.path)?;
        debug!(path = %self.path.display(), entries = doc.allow.len(), "policy file saved");
        Ok(())
    }

    fn parse_entries(&self, list: Vec<Value>) -> Vec<PolicyEntry> {
        list.into_iter()
            .filter_map(|raw| match serde_json::from_value::<PolicyEntry>(raw.clone()) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        entry = %raw,
                        error = %err,
                        "invalid entry in policy file, skipped"
                    );
                    None
                }
            })
            .collect()
    }

    fn backup(&self) -> Result<PathBuf, PolicyError> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.6f").to_string();
        let backup = self.sibling(&format!("{stamp}.bak"));
        fs::copy(&self.path, &backup)?;
        Ok(backup)
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".");
        name.push(suffix);
        PathBuf::from(name)
    }

    fn corrupt(&self, reason: impl fmt::Display) -> PolicyError {
        PolicyError::Corrupt {
            path: self.path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Serialize)]
struct FileImage<'a> {
    allow: &'a [PolicyEntry],
    deny: &'a [PolicyEntry],
    groups: &'a Groups,
    roles: &'a Roles,
    version: PolicyVersion,
}

fn take_list(root: &mut Map<String, Value>, key: &str) -> Vec<Value> {
    match root.remove(key) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}
