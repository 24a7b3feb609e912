//! Exported methods of the authentication service.

use super::{ALLOW_AUTH_MODIFICATIONS, ServiceState};
use crate::error::{AuthError, AuthResult};
use crate::rpc::{CallContext, RpcDispatcher, str_list_param, str_param};
use crate::triage::TriageState;
use capgate_policy::{EntryList, PolicyEntry};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

type Args = Map<String, Value>;

fn to_json<T: Serialize>(value: T) -> AuthResult<Value> {
    serde_json::to_value(value).map_err(|e| AuthError::Internal(e.to_string()))
}

fn parse_param<T: DeserializeOwned>(args: &Args, name: &str) -> AuthResult<T> {
    let value = args
        .get(name)
        .cloned()
        .ok_or_else(|| AuthError::InvalidParams(format!("missing parameter '{name}'")))?;
    serde_json::from_value(value)
        .map_err(|e| AuthError::InvalidParams(format!("parameter '{name}': {e}")))
}

fn opt_param<T: DeserializeOwned + Default>(args: &Args, name: &str) -> AuthResult<T> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(_) => parse_param(args, name),
    }
}

/// Register a method whose body runs synchronously against the service state.
fn export<F>(
    dispatcher: &mut RpcDispatcher,
    state: &Arc<ServiceState>,
    name: &str,
    capabilities: &[&str],
    params: &[&'static str],
    body: F,
) where
    F: Fn(&ServiceState, &CallContext, &Args) -> AuthResult<Value> + Send + Sync + 'static,
{
    let state = Arc::clone(state);
    dispatcher.register_method(name, capabilities, params, move |ctx, args| {
        std::future::ready(body(&state, &ctx, &args))
    });
}

/// Build the dispatcher exporting the administrative surface.
pub(super) fn build_dispatcher(state: &Arc<ServiceState>) -> RpcDispatcher {
    let identity = state.identity().to_string();
    let mut d = RpcDispatcher::new(identity.clone(), identity, state.store().clone());
    let modify: &[&str] = &[ALLOW_AUTH_MODIFICATIONS];

    // queries
    export(&mut d, state, "get_user_to_capabilities", &[], &[], |s, _, _| {
        to_json(s.user_to_capabilities())
    });
    export(&mut d, state, "get_authorizations", &[], &["user_id"], |s, _, a| {
        to_json(s.authorizations(str_param(a, "user_id")?))
    });
    export(&mut d, state, "get_capabilities", &[], &["user_id"], |s, _, a| {
        to_json(s.capabilities(str_param(a, "user_id")?))
    });
    export(&mut d, state, "get_groups", &[], &["user_id"], |s, _, a| {
        to_json(s.groups(str_param(a, "user_id")?))
    });
    export(&mut d, state, "get_roles", &[], &["user_id"], |s, _, a| {
        to_json(s.roles(str_param(a, "user_id")?))
    });

    // failure triage
    export(&mut d, state, "get_authorization_failures", &[], &[], |s, _, _| {
        to_json(s.failures(TriageState::Pending))
    });
    export(&mut d, state, "get_authorization_approved", &[], &[], |s, _, _| {
        to_json(s.failures(TriageState::Approved))
    });
    export(&mut d, state, "get_authorization_denied", &[], &[], |s, _, _| {
        to_json(s.failures(TriageState::Denied))
    });
    export(&mut d, state, "approve_authorization_failure", modify, &["user_id"], |s, _, a| {
        s.approve_failure(str_param(a, "user_id")?)?;
        Ok(Value::Null)
    });
    export(&mut d, state, "deny_authorization_failure", modify, &["user_id"], |s, _, a| {
        s.deny_failure(str_param(a, "user_id")?)?;
        Ok(Value::Null)
    });
    export(&mut d, state, "delete_authorization_failure", modify, &["user_id"], |s, _, a| {
        s.delete_failure(str_param(a, "user_id")?)?;
        Ok(Value::Null)
    });

    // per-identity rpc allowances
    export(
        &mut d,
        state,
        "update_id_rpc_authorizations",
        &[],
        &["identity", "rpc_methods"],
        |s, ctx, a| {
            let identity = str_param(a, "identity")?;
            if let Some(caller) = ctx.caller.as_deref() {
                let owns = s
                    .store()
                    .snapshot()
                    .document
                    .find_by_user_id(caller)
                    .is_some_and(|(_, e)| e.identity.as_deref() == Some(identity));
                if !owns && !s.capabilities(caller).contains(ALLOW_AUTH_MODIFICATIONS) {
                    return Err(AuthError::Unauthorized {
                        method: "update_id_rpc_authorizations".into(),
                        required: vec![ALLOW_AUTH_MODIFICATIONS.into()],
                        provided: s.capabilities(caller).names().map(str::to_string).collect(),
                    });
                }
            }
            let methods: BTreeMap<String, Vec<String>> = parse_param(a, "rpc_methods")?;
            to_json(s.update_id_rpc_authorizations(identity, methods)?)
        },
    );
    export(
        &mut d,
        state,
        "add_rpc_authorizations",
        modify,
        &["identity", "method", "authorizations"],
        |s, _, a| {
            s.add_rpc_authorizations(
                str_param(a, "identity")?,
                str_param(a, "method")?,
                str_list_param(a, "authorizations")?,
            )?;
            Ok(Value::Null)
        },
    );
    export(
        &mut d,
        state,
        "delete_rpc_authorizations",
        modify,
        &["identity", "method", "denied_authorizations"],
        |s, _, a| {
            s.delete_rpc_authorizations(
                str_param(a, "identity")?,
                str_param(a, "method")?,
                str_list_param(a, "denied_authorizations")?,
            )?;
            Ok(Value::Null)
        },
    );

    // direct policy file access
    export(&mut d, state, "auth_file.read", modify, &[], |s, _, _| {
        let snapshot = s.store().snapshot();
        let doc = &snapshot.document;
        Ok(serde_json::json!({
            "allow": to_json(&doc.allow)?,
            "deny": to_json(&doc.deny)?,
            "groups": to_json(&doc.groups)?,
            "roles": to_json(&doc.roles)?,
        }))
    });
    export(&mut d, state, "auth_file.find_by_credentials", modify, &["credentials"], |s, _, a| {
        let credential = str_param(a, "credentials")?;
        let snapshot = s.store().snapshot();
        to_json(snapshot.document.find_by_credential(credential, EntryList::Allow))
    });
    export(&mut d, state, "auth_file.add", modify, &["entry", "overwrite"], |s, _, a| {
        let entry: PolicyEntry = parse_param(a, "entry")?;
        let overwrite: bool = opt_param(a, "overwrite")?;
        s.store().add(entry, EntryList::Allow, overwrite)?;
        Ok(Value::Null)
    });
    export(&mut d, state, "auth_file.update_by_index", modify, &["entry", "index"], |s, _, a| {
        let entry: PolicyEntry = parse_param(a, "entry")?;
        let index: usize = parse_param(a, "index")?;
        s.store().update_by_index(entry, index, EntryList::Allow)?;
        Ok(Value::Null)
    });
    export(&mut d, state, "auth_file.remove_by_credentials", modify, &["credentials"], |s, _, a| {
        let removed = s
            .store()
            .remove_by_credential(str_param(a, "credentials")?, EntryList::Allow)?;
        to_json(removed)
    });
    export(&mut d, state, "auth_file.remove_by_index", modify, &["index"], |s, _, a| {
        let index: usize = parse_param(a, "index")?;
        s.store().remove_by_indices(&[index], EntryList::Allow)?;
        Ok(Value::Null)
    });
    export(&mut d, state, "auth_file.remove_by_indices", modify, &["indices"], |s, _, a| {
        let indices: Vec<usize> = parse_param(a, "indices")?;
        s.store().remove_by_indices(&indices, EntryList::Allow)?;
        Ok(Value::Null)
    });
    export(&mut d, state, "auth_file.set_groups", modify, &["groups"], |s, _, a| {
        s.store().set_groups(&parse_param::<Value>(a, "groups")?)?;
        Ok(Value::Null)
    });
    export(&mut d, state, "auth_file.set_roles", modify, &["roles"], |s, _, a| {
        s.store().set_roles(&parse_param::<Value>(a, "roles")?)?;
        Ok(Value::Null)
    });

    d
}
