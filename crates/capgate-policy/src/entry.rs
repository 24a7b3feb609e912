//! Policy entries and credential matching.

use crate::capability::{Capabilities, Constraint};
use crate::error::PolicyError;
use crate::mechanism::{Mechanism, ENCODED_CURVE_KEY_LEN};
use crate::pattern::{is_regex, Pattern};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One allow rule: which handshakes it admits and what the admitted peer may do.
///
/// `user_id` is generated when the file omits it. An explicitly empty
/// `user_id` is kept as-is; such an entry admits peers under an identifier
/// synthesized from the handshake tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEntry", into = "RawEntry")]
pub struct PolicyEntry {
    /// Domain pattern; `None` matches any domain.
    pub domain: Option<Pattern>,
    /// Address pattern; `None` matches any address.
    pub address: Option<Pattern>,
    /// Mechanism the handshake must use.
    pub mechanism: Mechanism,
    /// Credential pattern; always `Some` unless the mechanism is NULL.
    pub credential: Option<Pattern>,
    /// Identifier handed to the transport on a successful handshake.
    pub user_id: String,
    /// Logical peer name the entry belongs to, if declared.
    pub identity: Option<String>,
    /// Groups, each naming a list of roles.
    pub groups: Vec<String>,
    /// Roles, each naming a list of capabilities.
    pub roles: Vec<String>,
    /// Capabilities granted directly on this entry.
    pub capabilities: Capabilities,
    /// Method name to the capabilities that individually allow calling it.
    pub rpc_method_authorizations: BTreeMap<String, Vec<String>>,
    /// Free-form operator notes.
    pub comments: Option<String>,
    /// Disabled entries are kept in the file but never matched.
    pub enabled: bool,
}

/// On-disk shape of an entry, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawEntry {
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    mechanism: Mechanism,
    #[serde(default, alias = "credentials")]
    credential: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    identity: Option<String>,
    #[serde(default)]
    groups: Option<Vec<String>>,
    #[serde(default)]
    roles: Option<Vec<String>>,
    #[serde(default)]
    capabilities: Capabilities,
    #[serde(default)]
    rpc_method_authorizations: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    comments: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

fn build_field(value: Option<String>) -> Result<Option<Pattern>, PolicyError> {
    match value {
        Some(v) if !v.is_empty() => Pattern::parse(&v).map(Some),
        _ => Ok(None),
    }
}

/// Check that `credential` is acceptable for `mechanism`.
pub fn validate_credential(
    mechanism: Mechanism,
    credential: Option<&str>,
) -> Result<(), PolicyError> {
    if mechanism == Mechanism::Null {
        return Ok(());
    }
    let Some(credential) = credential.filter(|c| !c.is_empty()) else {
        return Err(PolicyError::InvalidEntry(format!(
            "credential is required for mechanism {mechanism}"
        )));
    };
    if is_regex(credential) {
        return Ok(());
    }
    if mechanism == Mechanism::Curve {
        let decoded_len = URL_SAFE_NO_PAD.decode(credential).map(|k| k.len()).ok();
        if credential.len() != ENCODED_CURVE_KEY_LEN || decoded_len != Some(32) {
            return Err(PolicyError::InvalidEntry(format!(
                "invalid CURVE public key {credential:?}: expected {ENCODED_CURVE_KEY_LEN} \
                 base64 characters encoding 32 bytes"
            )));
        }
    }
    Ok(())
}

impl TryFrom<RawEntry> for PolicyEntry {
    type Error = PolicyError;

    fn try_from(raw: RawEntry) -> Result<Self, Self::Error> {
        validate_credential(raw.mechanism, raw.credential.as_deref())?;
        let credential = build_field(raw.credential)?;
        Ok(Self {
            domain: build_field(raw.domain)?,
            address: build_field(raw.address)?,
            mechanism: raw.mechanism,
            credential,
            user_id: raw
                .user_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            identity: raw.identity,
            groups: raw.groups.unwrap_or_default(),
            roles: raw.roles.unwrap_or_default(),
            capabilities: raw.capabilities,
            rpc_method_authorizations: raw.rpc_method_authorizations.unwrap_or_default(),
            comments: raw.comments,
            enabled: raw.enabled,
        })
    }
}

impl From<PolicyEntry> for RawEntry {
    fn from(entry: PolicyEntry) -> Self {
        Self {
            domain: entry.domain.map(|p| p.as_str().to_string()),
            address: entry.address.map(|p| p.as_str().to_string()),
            mechanism: entry.mechanism,
            credential: entry.credential.map(|p| p.as_str().to_string()),
            user_id: Some(entry.user_id),
            identity: entry.identity,
            groups: Some(entry.groups),
            roles: Some(entry.roles),
            capabilities: entry.capabilities,
            rpc_method_authorizations: Some(entry.rpc_method_authorizations),
            comments: entry.comments,
            enabled: entry.enabled,
        }
    }
}

impl PolicyEntry {
    /// Start building an entry for `mechanism`.
    pub fn builder(mechanism: Mechanism) -> EntryBuilder {
        EntryBuilder {
            raw: RawEntry {
                mechanism,
                enabled: true,
                ..RawEntry::default()
            },
        }
    }

    /// Match a handshake tuple against this entry.
    ///
    /// Only the first credential frame is compared. NULL entries ignore
    /// credentials entirely.
    pub fn matches<S: AsRef<str>>(
        &self,
        domain: &str,
        address: &str,
        mechanism: Mechanism,
        credentials: &[S],
    ) -> bool {
        if !self.enabled || self.mechanism != mechanism {
            return false;
        }
        if self.domain.as_ref().is_some_and(|p| !p.matches(domain)) {
            return false;
        }
        if self.address.as_ref().is_some_and(|p| !p.matches(address)) {
            return false;
        }
        if mechanism == Mechanism::Null {
            return true;
        }
        match (&self.credential, credentials.first()) {
            (Some(pattern), Some(supplied)) => pattern.matches(supplied.as_ref()),
            _ => false,
        }
    }

    /// Whether the credential is a `/regex/` (such entries sort last).
    #[inline]
    pub fn has_regex_credential(&self) -> bool {
        self.credential.as_ref().is_some_and(Pattern::is_regex)
    }

    /// Credential text as written, if any.
    pub fn credential_str(&self) -> Option<&str> {
        self.credential.as_ref().map(Pattern::as_str)
    }

    /// Whether `other` admits exactly the same handshake tuple (compared textually).
    pub fn same_match_key(&self, other: &PolicyEntry) -> bool {
        self.domain == other.domain
            && self.address == other.address
            && self.mechanism == other.mechanism
            && self.credential == other.credential
    }
}

/// Builder for [`PolicyEntry`], validating on [`build`](EntryBuilder::build).
#[derive(Debug, Clone)]
pub struct EntryBuilder {
    raw: RawEntry,
}

impl EntryBuilder {
    /// Domain pattern.
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.raw.domain = Some(domain.into());
        self
    }

    /// Address pattern.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.raw.address = Some(address.into());
        self
    }

    /// Credential pattern.
    pub fn credential(mut self, credential: impl Into<String>) -> Self {
        self.raw.credential = Some(credential.into());
        self
    }

    /// Explicit user id (otherwise a UUID is generated).
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.raw.user_id = Some(user_id.into());
        self
    }

    /// Declared peer identity.
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.raw.identity = Some(identity.into());
        self
    }

    /// Group memberships.
    pub fn groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.raw.groups = Some(groups.into_iter().map(Into::into).collect());
        self
    }

    /// Role memberships.
    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.raw.roles = Some(roles.into_iter().map(Into::into).collect());
        self
    }

    /// Grant one capability.
    pub fn capability(mut self, name: impl Into<String>, constraint: Option<Constraint>) -> Self {
        self.raw.capabilities.insert(name, constraint);
        self
    }

    /// Replace the whole capability set.
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.raw.capabilities = capabilities;
        self
    }

    /// Declare the capabilities that allow calling `method`.
    pub fn rpc_method<I, S>(mut self, method: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.raw
            .rpc_method_authorizations
            .get_or_insert_with(BTreeMap::new)
            .insert(method.into(), capabilities.into_iter().map(Into::into).collect());
        self
    }

    /// Operator comment.
    pub fn comments(mut self, comments: impl Into<String>) -> Self {
        self.raw.comments = Some(comments.into());
        self
    }

    /// Enable or disable the entry.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.raw.enabled = enabled;
        self
    }

    /// Validate and produce the entry.
    pub fn build(self) -> Result<PolicyEntry, PolicyError> {
        PolicyEntry::try_from(self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KEY: &str = "wk2BXQdHkAlMIoXthOPhFOqWpapD1eWsBQYY7h4-bXw";

    fn plain(cred: &str) -> PolicyEntry {
        PolicyEntry::builder(Mechanism::Plain)
            .credential(cred)
            .user_id("u")
            .build()
            .unwrap()
    }

    #[test]
    fn disabled_entry_never_matches() {
        let entry = PolicyEntry::builder(Mechanism::Null)
            .enabled(false)
            .build()
            .unwrap();
        assert!(!entry.matches("vip", "127.0.0.1", Mechanism::Null, &[] as &[&str]));
    }

    #[test]
    fn mechanism_must_agree() {
        let entry = plain("pw");
        assert!(entry.matches("vip", "a", Mechanism::Plain, &["pw"]));
        assert!(!entry.matches("vip", "a", Mechanism::Curve, &["pw"]));
    }

    #[test]
    fn null_ignores_credentials() {
        let entry = PolicyEntry::builder(Mechanism::Null).build().unwrap();
        assert!(entry.matches("vip", "a", Mechanism::Null, &["anything"]));
        assert!(entry.matches("vip", "a", Mechanism::Null, &[] as &[&str]));
    }

    #[test]
    fn only_first_credential_frame_is_compared() {
        let entry = plain("pw");
        assert!(entry.matches("d", "a", Mechanism::Plain, &["pw", "ignored"]));
        assert!(!entry.matches("d", "a", Mechanism::Plain, &["nope", "pw"]));
        assert!(!entry.matches("d", "a", Mechanism::Plain, &[] as &[&str]));
    }

    #[test]
    fn domain_and_address_patterns() {
        let entry = PolicyEntry::builder(Mechanism::Plain)
            .credential("pw")
            .domain("vip")
            .address("/10\\.0\\.0\\.[0-9]+/")
            .build()
            .unwrap();
        assert!(entry.matches("vip", "10.0.0.42", Mechanism::Plain, &["pw"]));
        assert!(!entry.matches("other", "10.0.0.42", Mechanism::Plain, &["pw"]));
        assert!(!entry.matches("vip", "10.0.1.42", Mechanism::Plain, &["pw"]));
    }

    #[test]
    fn curve_credentials_are_checked() {
        assert!(PolicyEntry::builder(Mechanism::Curve).credential(KEY).build().is_ok());
        let err = PolicyEntry::builder(Mechanism::Curve)
            .credential("short")
            .build()
            .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidEntry(_)));
        assert!(PolicyEntry::builder(Mechanism::Curve).credential("/.*/").build().is_ok());
    }

    #[test]
    fn credential_required_unless_null() {
        assert!(PolicyEntry::builder(Mechanism::Plain).build().is_err());
        assert!(PolicyEntry::builder(Mechanism::Null).build().is_ok());
    }

    #[test]
    fn missing_user_id_is_generated() {
        let a: PolicyEntry =
            serde_json::from_value(json!({"mechanism": "NULL"})).unwrap();
        let b: PolicyEntry =
            serde_json::from_value(json!({"mechanism": "NULL"})).unwrap();
        assert!(!a.user_id.is_empty());
        assert_ne!(a.user_id, b.user_id);
    }

    #[test]
    fn accepts_legacy_credentials_key() {
        let entry: PolicyEntry =
            serde_json::from_value(json!({"mechanism": "PLAIN", "credentials": "pw"})).unwrap();
        assert_eq!(entry.credential_str(), Some("pw"));
    }

    #[test]
    fn bad_regex_fails_at_load() {
        let res: Result<PolicyEntry, _> =
            serde_json::from_value(json!({"mechanism": "PLAIN", "credential": "/(/"}));
        assert!(res.is_err());
    }

    #[test]
    fn serialization_round_trips() {
        let entry = PolicyEntry::builder(Mechanism::Plain)
            .credential("pw")
            .address("/.*/")
            .user_id("agent1")
            .identity("agent.one")
            .groups(["admin"])
            .capability("can_call_foo", Some([("x".to_string(), json!(1))].into()))
            .rpc_method("foo", ["can_call_foo"])
            .comments("test")
            .build()
            .unwrap();
        let text = serde_json::to_string(&entry).unwrap();
        let back: PolicyEntry = serde_json::from_str(&text).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn regex_credential_detection() {
        assert!(plain("/.*/").has_regex_credential());
        assert!(!plain("pw").has_regex_credential());
    }
}
