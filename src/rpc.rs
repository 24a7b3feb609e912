//! Capability-checked RPC dispatch.
//!
//! Every component that exports methods owns an [`RpcDispatcher`]. Methods
//! are registered explicitly with the capabilities that allow a remote call;
//! the dispatcher checks the caller's capabilities (including per-argument
//! constraints) before running the handler. The allow-lists can be replaced
//! at runtime by the authentication service through the builtin
//! `auth.set_rpc_authorizations` methods.

use crate::error::{AuthError, AuthResult};
use async_trait::async_trait;
use capgate_policy::{Capabilities, Constraint, values_equal};
use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tracing::{Instrument, debug, trace};

/// Capability required to replace a method's allow-list.
pub const MODIFY_ALLOWANCE_CAPABILITY: &str = "modify_rpc_method_allowance";

/// Builtin methods every dispatcher answers.
pub mod builtin {
    pub const UPDATE: &str = "auth.update";
    pub const SET_RPC_AUTHORIZATIONS: &str = "auth.set_rpc_authorizations";
    pub const SET_MULTIPLE_RPC_AUTHORIZATIONS: &str = "auth.set_multiple_rpc_authorizations";
    pub const GET_RPC_AUTHORIZATIONS: &str = "auth.get_rpc_authorizations";
    pub const GET_ALL_RPC_AUTHORIZATIONS: &str = "auth.get_all_rpc_authorizations";
}

/// Who is calling.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Authenticated user id of the remote caller; `None` for in-process calls.
    pub caller: Option<String>,
}

impl CallContext {
    /// An in-process call, never capability checked.
    pub fn local() -> Self {
        Self { caller: None }
    }

    pub fn remote(user_id: impl Into<String>) -> Self {
        Self {
            caller: Some(user_id.into()),
        }
    }
}

/// An exported method body.
#[async_trait]
pub trait RpcMethod: Send + Sync {
    async fn call(&self, ctx: CallContext, params: Map<String, Value>) -> AuthResult<Value>;
}

#[async_trait]
impl<F, Fut> RpcMethod for F
where
    F: Fn(CallContext, Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = AuthResult<Value>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, params: Map<String, Value>) -> AuthResult<Value> {
        (self)(ctx, params).await
    }
}

/// Source of a caller's capabilities.
pub trait CapabilityLookup: Send + Sync {
    /// Capabilities held by `user_id`; empty when unknown.
    fn capabilities(&self, user_id: &str) -> Capabilities;

    /// Replace the whole user map after an `auth.update` push.
    ///
    /// Returns false when this lookup is not fed by pushes.
    fn replace(&self, _users: BTreeMap<String, Capabilities>) -> bool {
        false
    }
}

/// Capabilities pushed by the authentication service.
#[derive(Debug, Default)]
pub struct PushedCapabilities {
    users: RwLock<BTreeMap<String, Capabilities>>,
}

impl PushedCapabilities {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CapabilityLookup for PushedCapabilities {
    fn capabilities(&self, user_id: &str) -> Capabilities {
        self.users.read().get(user_id).cloned().unwrap_or_default()
    }

    fn replace(&self, users: BTreeMap<String, Capabilities>) -> bool {
        *self.users.write() = users;
        true
    }
}

/// Whether `constraint` admits a call with `args`.
///
/// No constraint admits anything. Otherwise every constrained parameter
/// must be present with an equal value.
pub fn capability_authorizes_call(constraint: Option<&Constraint>, args: &Map<String, Value>) -> bool {
    first_mismatch(constraint, args).is_none()
}

/// The first constrained parameter `args` violates, with the required value
/// and the supplied one.
pub fn first_mismatch<'a>(
    constraint: Option<&'a Constraint>,
    args: &'a Map<String, Value>,
) -> Option<(&'a str, &'a Value, Option<&'a Value>)> {
    constraint?.iter().find_map(|(param, required)| match args.get(param) {
        Some(actual) if values_equal(required, actual) => None,
        actual => Some((param.as_str(), required, actual)),
    })
}

/// Turn positional, named or absent params into named arguments.
pub fn normalize_params(params: Value, names: &[&str]) -> AuthResult<Map<String, Value>> {
    match params {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        Value::Array(values) => {
            if values.len() > names.len() {
                return Err(AuthError::InvalidParams(format!(
                    "expected at most {} positional arguments, got {}",
                    names.len(),
                    values.len()
                )));
            }
            Ok(names
                .iter()
                .map(|n| n.to_string())
                .zip(values)
                .collect())
        }
        other => Err(AuthError::InvalidParams(format!(
            "params must be an object, array or null, got {other}"
        ))),
    }
}

/// Fetch a required string argument.
pub fn str_param<'a>(params: &'a Map<String, Value>, name: &str) -> AuthResult<&'a str> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| AuthError::InvalidParams(format!("missing string parameter '{name}'")))
}

/// Fetch a required list-of-strings argument. A bare string counts as a
/// one-element list.
pub fn str_list_param(params: &Map<String, Value>, name: &str) -> AuthResult<Vec<String>> {
    match params.get(name) {
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    AuthError::InvalidParams(format!("parameter '{name}' must list strings"))
                })
            })
            .collect(),
        _ => Err(AuthError::InvalidParams(format!(
            "missing list parameter '{name}'"
        ))),
    }
}

struct Registered {
    handler: Arc<dyn RpcMethod>,
    params: Vec<&'static str>,
}

/// Method table and allow-lists for one component.
pub struct RpcDispatcher {
    identity: String,
    auth_identity: String,
    methods: HashMap<String, Registered>,
    allowances: RwLock<HashMap<String, Vec<String>>>,
    lookup: Arc<dyn CapabilityLookup>,
}

impl RpcDispatcher {
    /// Create an empty dispatcher for the component `identity`.
    ///
    /// `auth_identity` is the only remote caller whose `auth.update` pushes
    /// are accepted.
    pub fn new(
        identity: impl Into<String>,
        auth_identity: impl Into<String>,
        lookup: Arc<dyn CapabilityLookup>,
    ) -> Self {
        Self {
            identity: identity.into(),
            auth_identity: auth_identity.into(),
            methods: HashMap::new(),
            allowances: RwLock::new(HashMap::new()),
            lookup,
        }
    }

    /// Identity of the owning component.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Export `name`. Any one of `capabilities` allows a remote call; an
    /// empty list leaves the method open to every authenticated caller.
    pub fn register_method<F, Fut>(
        &mut self,
        name: &str,
        capabilities: &[&str],
        params: &[&'static str],
        handler: F,
    ) where
        F: Fn(CallContext, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AuthResult<Value>> + Send + 'static,
    {
        self.methods.insert(
            name.to_string(),
            Registered {
                handler: Arc::new(handler),
                params: params.to_vec(),
            },
        );
        self.allowances.get_mut().insert(
            name.to_string(),
            capabilities.iter().map(|c| c.to_string()).collect(),
        );
    }

    /// Names of all exported methods, builtins excluded.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Allow-list of `method`; `None` if it was never registered.
    pub fn rpc_authorizations(&self, method: &str) -> Option<Vec<String>> {
        self.allowances.read().get(method).cloned()
    }

    /// Every allow-list.
    pub fn all_rpc_authorizations(&self) -> BTreeMap<String, Vec<String>> {
        self.allowances
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Replace the allow-list of a registered method.
    pub fn set_rpc_authorizations(&self, method: &str, capabilities: Vec<String>) -> AuthResult<()> {
        let mut allowances = self.allowances.write();
        match allowances.get_mut(method) {
            Some(slot) => {
                debug!(component = %self.identity, method = %method, ?capabilities, "rpc allow-list replaced");
                *slot = capabilities;
                Ok(())
            }
            None => Err(AuthError::UnknownMethod(method.to_string())),
        }
    }

    /// Check whether `ctx` may call `method` with `args`.
    pub fn authorize(&self, ctx: &CallContext, method: &str, args: &Map<String, Value>) -> AuthResult<()> {
        let Some(user_id) = ctx.caller.as_deref() else {
            return Ok(());
        };
        let allowed = self
            .rpc_authorizations(method)
            .ok_or_else(|| AuthError::UnknownMethod(method.to_string()))?;
        if allowed.is_empty() {
            return Ok(());
        }
        let held = self.lookup.capabilities(user_id);
        let mut mismatch = None;
        for name in &allowed {
            let Some(constraint) = held.get(name) else {
                continue;
            };
            match first_mismatch(constraint, args) {
                None => {
                    trace!(user_id = %user_id, method = %method, capability = %name, "rpc call authorized");
                    return Ok(());
                }
                Some((param, required, actual)) if mismatch.is_none() => {
                    mismatch = Some(AuthError::ArgumentMismatch {
                        user_id: user_id.to_string(),
                        method: method.to_string(),
                        param: param.to_string(),
                        required: required.clone(),
                        actual: actual.cloned(),
                    });
                }
                Some(_) => {}
            }
        }
        debug!(user_id = %user_id, method = %method, required = ?allowed, "rpc call denied");
        Err(mismatch.unwrap_or_else(|| AuthError::Unauthorized {
            method: method.to_string(),
            required: allowed,
            provided: held.names().map(str::to_string).collect(),
        }))
    }

    /// Authorize and run one call.
    pub async fn call(&self, ctx: CallContext, method: &str, params: Value) -> AuthResult<Value> {
        let span = crate::telemetry::spans::rpc(&self.identity, method, ctx.caller.as_deref());
        async move {
            if method.starts_with("auth.") && !self.methods.contains_key(method) {
                return self.call_builtin(&ctx, method, params);
            }
            let registered = self
                .methods
                .get(method)
                .ok_or_else(|| AuthError::UnknownMethod(method.to_string()))?;
            let args = normalize_params(params, &registered.params)?;
            self.authorize(&ctx, method, &args)?;
            registered.handler.call(ctx, args).await
        }
        .instrument(span)
        .await
    }

    /// The authentication service itself always passes.
    fn require_capability(&self, ctx: &CallContext, capability: &str, method: &str) -> AuthResult<()> {
        let Some(user_id) = ctx.caller.as_deref() else {
            return Ok(());
        };
        if user_id == self.auth_identity {
            return Ok(());
        }
        let held = self.lookup.capabilities(user_id);
        if held.contains(capability) {
            Ok(())
        } else {
            Err(AuthError::Unauthorized {
                method: method.to_string(),
                required: vec![capability.to_string()],
                provided: held.names().map(str::to_string).collect(),
            })
        }
    }

    fn call_builtin(&self, ctx: &CallContext, method: &str, params: Value) -> AuthResult<Value> {
        match method {
            builtin::UPDATE => {
                if ctx.caller.as_deref().is_some_and(|c| c != self.auth_identity) {
                    return Err(AuthError::Unauthorized {
                        method: method.to_string(),
                        required: vec![self.auth_identity.clone()],
                        provided: Vec::new(),
                    });
                }
                let args = normalize_params(params, &["user_to_caps"])?;
                let users = args
                    .get("user_to_caps")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                let users: BTreeMap<String, Capabilities> = serde_json::from_value(users)
                    .map_err(|e| AuthError::InvalidParams(e.to_string()))?;
                let count = users.len();
                if self.lookup.replace(users) {
                    debug!(component = %self.identity, users = count, "capabilities updated");
                }
                Ok(Value::Null)
            }
            builtin::SET_RPC_AUTHORIZATIONS => {
                self.require_capability(ctx, MODIFY_ALLOWANCE_CAPABILITY, method)?;
                let args = normalize_params(params, &["method_str", "capabilities"])?;
                let target = str_param(&args, "method_str")?;
                let caps = str_list_param(&args, "capabilities")?;
                self.set_rpc_authorizations(target, caps)?;
                Ok(Value::Null)
            }
            builtin::SET_MULTIPLE_RPC_AUTHORIZATIONS => {
                self.require_capability(ctx, MODIFY_ALLOWANCE_CAPABILITY, method)?;
                let args = normalize_params(params, &["rpc_authorizations"])?;
                let Some(Value::Object(map)) = args.get("rpc_authorizations") else {
                    return Err(AuthError::InvalidParams(
                        "rpc_authorizations must map method names to capability lists".into(),
                    ));
                };
                // validate every method before touching any allow-list
                let mut updates = Vec::with_capacity(map.len());
                for (target, caps) in map {
                    let caps = str_list_param(&Map::from_iter([("caps".to_string(), caps.clone())]), "caps")?;
                    if self.rpc_authorizations(target).is_none() {
                        return Err(AuthError::UnknownMethod(target.clone()));
                    }
                    updates.push((target.as_str(), caps));
                }
                for (target, caps) in updates {
                    self.set_rpc_authorizations(target, caps)?;
                }
                Ok(Value::Null)
            }
            builtin::GET_RPC_AUTHORIZATIONS => {
                let args = normalize_params(params, &["method_str"])?;
                let target = str_param(&args, "method_str")?;
                let caps = self
                    .rpc_authorizations(target)
                    .ok_or_else(|| AuthError::UnknownMethod(target.to_string()))?;
                Ok(json!(caps))
            }
            builtin::GET_ALL_RPC_AUTHORIZATIONS => Ok(json!(self.all_rpc_authorizations())),
            _ => Err(AuthError::UnknownMethod(method.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(value: Value) -> Capabilities {
        Capabilities::from_value(&value).unwrap()
    }

    fn dispatcher(lookup: Arc<PushedCapabilities>) -> RpcDispatcher {
        let mut d = RpcDispatcher::new("agent1", "platform.auth", lookup);
        d.register_method("foo", &["can_call_foo"], &["x"], |_ctx, args: Map<String, Value>| async move {
            Ok(args.get("x").cloned().unwrap_or(Value::Null))
        });
        d.register_method("ping", &[], &[], |_ctx, _args| async { Ok(json!("pong")) });
        d
    }

    fn push(lookup: &PushedCapabilities, user: &str, c: Value) {
        lookup.replace(BTreeMap::from([(user.to_string(), caps(c))]));
    }

    #[tokio::test]
    async fn test_missing_capability_is_denied() {
        let lookup = Arc::new(PushedCapabilities::new());
        let d = dispatcher(lookup.clone());
        let err = d
            .call(CallContext::remote("agent2"), "foo", json!([1]))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized { .. }));
        assert!(err.to_string().contains("can_call_foo"));

        push(&lookup, "agent2", json!(["can_call_foo"]));
        let out = d.call(CallContext::remote("agent2"), "foo", json!([1])).await.unwrap();
        assert_eq!(out, json!(1));
    }

    #[tokio::test]
    async fn test_argument_constraint() {
        let lookup = Arc::new(PushedCapabilities::new());
        let d = dispatcher(lookup.clone());
        push(&lookup, "agent2", json!({"can_call_foo": {"x": 1}}));

        let ok = d.call(CallContext::remote("agent2"), "foo", json!({"x": 1.0})).await;
        assert_eq!(ok.unwrap(), json!(1.0));

        let err = d
            .call(CallContext::remote("agent2"), "foo", json!({"x": 42}))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ArgumentMismatch { ref param, .. } if param == "x"));
        assert!(err.to_string().contains("x=1 but called with x=42"));
    }

    #[tokio::test]
    async fn test_open_and_unknown_methods() {
        let lookup = Arc::new(PushedCapabilities::new());
        let d = dispatcher(lookup);
        let out = d.call(CallContext::remote("anyone"), "ping", Value::Null).await;
        assert_eq!(out.unwrap(), json!("pong"));
        let err = d.call(CallContext::remote("anyone"), "nope", Value::Null).await;
        assert!(matches!(err, Err(AuthError::UnknownMethod(_))));
    }

    #[tokio::test]
    async fn test_local_calls_skip_checks() {
        let d = dispatcher(Arc::new(PushedCapabilities::new()));
        let out = d.call(CallContext::local(), "foo", json!({"x": 3})).await;
        assert_eq!(out.unwrap(), json!(3));
    }

    #[tokio::test]
    async fn test_builtin_allowance_updates() {
        let lookup = Arc::new(PushedCapabilities::new());
        let d = dispatcher(lookup.clone());

        let err = d
            .call(
                CallContext::remote("agent2"),
                builtin::SET_RPC_AUTHORIZATIONS,
                json!(["ping", ["can_ping"]]),
            )
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());

        d.call(
            CallContext::remote("platform.auth"),
            builtin::UPDATE,
            json!({"user_to_caps": {"admin": {"modify_rpc_method_allowance": null}}}),
        )
        .await
        .unwrap();
        d.call(
            CallContext::remote("admin"),
            builtin::SET_MULTIPLE_RPC_AUTHORIZATIONS,
            json!({"rpc_authorizations": {"ping": ["can_ping"], "foo": "can_call_foo"}}),
        )
        .await
        .unwrap();

        let got = d
            .call(CallContext::remote("x"), builtin::GET_RPC_AUTHORIZATIONS, json!(["ping"]))
            .await
            .unwrap();
        assert_eq!(got, json!(["can_ping"]));
        let err = d.call(CallContext::remote("agent2"), "ping", Value::Null).await;
        assert!(err.unwrap_err().is_unauthorized());
    }

    #[tokio::test]
    async fn test_update_only_from_auth_identity() {
        let lookup = Arc::new(PushedCapabilities::new());
        let d = dispatcher(lookup.clone());
        let err = d
            .call(CallContext::remote("mallory"), builtin::UPDATE, json!([{"mallory": ["can_call_foo"]}]))
            .await;
        assert!(err.is_err());
        assert!(lookup.capabilities("mallory").is_empty());
    }

    #[test]
    fn test_constraint_helpers() {
        let constraint: Constraint = BTreeMap::from([("device".to_string(), json!("fakedriver1"))]);
        let good = json!({"device": "fakedriver1", "point": "p"});
        let bad = json!({"point": "p"});
        assert!(capability_authorizes_call(Some(&constraint), good.as_object().unwrap()));
        assert!(!capability_authorizes_call(Some(&constraint), bad.as_object().unwrap()));
        assert!(capability_authorizes_call(None, bad.as_object().unwrap()));
    }
}
