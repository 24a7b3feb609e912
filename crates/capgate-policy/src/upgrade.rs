//! Schema upgrade chain for policy files older than the current version.
//!
//! Steps run in order on the raw JSON so that each one sees exactly the
//! shape the previous version wrote. Entries a step cannot convert are
//! dropped with a warning.

use crate::capability::Capabilities;
use crate::file::PolicyVersion;
use crate::pattern::is_regex;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use tracing::warn;

/// Identities whose config-store grant covers every identity after 1.2.
const PLATFORM_WIDE_IDENTITIES: &[&str] = &["control", "platform.agent"];

/// Run every step needed to bring `list` from `version` to 1.3.
pub(crate) fn upgrade_entries(list: Vec<Value>, version: PolicyVersion, path: &str) -> Vec<Value> {
    let mut list = list;
    let mut version = version;
    if version.major == 0 {
        list = split_mechanism(list, path);
        version = PolicyVersion::new(1, 0);
    }
    if version == PolicyVersion::new(1, 0) {
        list = assign_user_ids(list);
        version.minor = 1;
    }
    if version == PolicyVersion::new(1, 1) {
        list = normalize_capabilities(list, path);
        version.minor = 2;
    }
    if version == PolicyVersion::new(1, 2) {
        list = normalize_rpc_authorizations(list, path);
    }
    list
}

fn warn_invalid(entry: &Value, path: &str, msg: &str) {
    warn!(entry = %entry, path = %path, reason = msg, "invalid entry in policy file, dropped during upgrade");
}

/// 0 → 1.0: split `"PLAIN:secret"` into mechanism and credential.
fn split_mechanism(list: Vec<Value>, path: &str) -> Vec<Value> {
    let mut out = Vec::with_capacity(list.len());
    for entry in list {
        let Some(credentials) = entry.get("credentials").and_then(Value::as_str) else {
            warn_invalid(&entry, path, "missing credentials");
            continue;
        };
        if is_regex(credentials) {
            warn_invalid(&entry, path, "cannot upgrade entries with regex credentials");
            continue;
        }
        let (mechanism, credential) = if credentials == "NULL" {
            ("NULL", Value::Null)
        } else {
            match credentials.split_once(':') {
                Some((mech @ ("PLAIN" | "CURVE"), rest)) => (mech, Value::from(rest)),
                _ => {
                    warn_invalid(&entry, path, "expected NULL, PLAIN or CURVE credentials");
                    continue;
                }
            }
        };
        let field = |name: &str, default: Value| entry.get(name).cloned().unwrap_or(default);
        out.push(json!({
            "domain": field("domain", Value::Null),
            "address": field("address", Value::Null),
            "mechanism": mechanism,
            "credentials": credential,
            "user_id": field("user_id", Value::Null),
            "groups": field("groups", json!([])),
            "roles": field("roles", json!([])),
            "capabilities": field("capabilities", json!([])),
            "comments": field("comments", Value::Null),
            "enabled": field("enabled", Value::Bool(true)),
        }));
    }
    out
}

/// 1.0 → 1.1: every entry gets a unique `user_id`.
fn assign_user_ids(list: Vec<Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    list.into_iter()
        .map(|mut entry| {
            let current = entry
                .get("user_id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string);
            let user_id = match current {
                Some(id) if !seen.contains(&id) => id,
                Some(id) => {
                    let fresh = uuid::Uuid::new_v4().to_string();
                    warn!(user_id = %id, new_user_id = %fresh, "duplicate user_id in policy file, reassigned");
                    fresh
                }
                None => uuid::Uuid::new_v4().to_string(),
            };
            seen.insert(user_id.clone());
            if let Some(obj) = entry.as_object_mut() {
                obj.insert("user_id".into(), Value::from(user_id));
            }
            entry
        })
        .collect()
}

/// 1.1 → 1.2: capability object form plus a self-scoped `edit_config_store` grant.
fn normalize_capabilities(list: Vec<Value>, path: &str) -> Vec<Value> {
    let mut out = Vec::with_capacity(list.len());
    for mut entry in list {
        let user_id = entry
            .get("user_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let scope = if PLATFORM_WIDE_IDENTITIES.contains(&user_id.as_str()) {
            "/.*/".to_string()
        } else {
            user_id
        };
        let raw = entry.get("capabilities").cloned().unwrap_or(Value::Null);
        let mut caps = match Capabilities::from_value(&raw) {
            Ok(caps) => caps,
            Err(err) => {
                warn_invalid(&entry, path, &err.to_string());
                continue;
            }
        };
        caps.insert(
            "edit_config_store",
            Some([("identity".to_string(), Value::from(scope))].into()),
        );
        if let Some(obj) = entry.as_object_mut() {
            obj.insert("capabilities".into(), caps.to_value());
        }
        out.push(entry);
    }
    out
}

/// 1.2 → 1.3: `rpc_method_authorizations` becomes `{method: [capability, ...]}`.
fn normalize_rpc_authorizations(list: Vec<Value>, path: &str) -> Vec<Value> {
    let mut out = Vec::with_capacity(list.len());
    for mut entry in list {
        let normalized = match entry.get("rpc_method_authorizations") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(methods)) => methods
                .iter()
                .map(|(method, caps)| {
                    let caps = match caps {
                        Value::String(s) if s.is_empty() => json!([]),
                        Value::String(s) => json!([s]),
                        Value::Array(_) => caps.clone(),
                        _ => json!([]),
                    };
                    (method.clone(), caps)
                })
                .collect(),
            Some(_) => {
                warn_invalid(&entry, path, "rpc_method_authorizations must be an object");
                continue;
            }
        };
        if let Some(obj) = entry.as_object_mut() {
            obj.insert("rpc_method_authorizations".into(), Value::Object(normalized));
        }
        out.push(entry);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_splits_combined_credentials() {
        let list = vec![
            json!({"credentials": "PLAIN:secret", "user_id": "a"}),
            json!({"credentials": "NULL"}),
            json!({"credentials": "/.*/"}),
            json!({"credentials": "GSSAPI:x"}),
        ];
        let out = split_mechanism(list, "auth.json");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["mechanism"], "PLAIN");
        assert_eq!(out[0]["credentials"], "secret");
        assert_eq!(out[1]["mechanism"], "NULL");
        assert!(out[1]["credentials"].is_null());
    }

    #[test]
    fn user_ids_become_unique() {
        let out = assign_user_ids(vec![
            json!({"user_id": "dup"}),
            json!({"user_id": "dup"}),
            json!({}),
        ]);
        let ids: HashSet<_> = out.iter().map(|e| e["user_id"].as_str().unwrap()).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains("dup"));
    }

    #[test]
    fn capabilities_gain_config_store_grant() {
        let out = normalize_capabilities(
            vec![
                json!({"user_id": "agent1", "capabilities": ["can_call_foo"]}),
                json!({"user_id": "control", "capabilities": null}),
            ],
            "auth.json",
        );
        assert_eq!(out[0]["capabilities"]["can_call_foo"], Value::Null);
        assert_eq!(out[0]["capabilities"]["edit_config_store"]["identity"], "agent1");
        assert_eq!(out[1]["capabilities"]["edit_config_store"]["identity"], "/.*/");
    }

    #[test]
    fn full_chain_from_version_zero() {
        let out = upgrade_entries(
            vec![json!({"credentials": "PLAIN:pw"})],
            PolicyVersion::new(0, 0),
            "auth.json",
        );
        assert_eq!(out.len(), 1);
        assert!(out[0]["user_id"].as_str().is_some());
        assert_eq!(out[0]["rpc_method_authorizations"], json!({}));
    }
}
