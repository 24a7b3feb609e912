//! Integration tests for capability-gated RPC between peers.

mod common;

use capgate::rpc::{PushedCapabilities, RpcDispatcher};
use common::{TestClient, TestServer};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

const POLICY: &str = r#"{
    "version": {"major": 1, "minor": 3},
    "allow": [
        {"mechanism": "NULL", "user_id": "agent1", "identity": "agent1", "capabilities": {}},
        {"mechanism": "PLAIN", "credentials": "agent2-key", "user_id": "agent2", "identity": "agent2"},
        {"mechanism": "PLAIN", "credentials": "admin-key", "user_id": "admin",
         "capabilities": {"allow_auth_modifications": null}}
    ]
}"#;

/// agent1's exported methods, enforced with the capabilities the service pushes.
fn agent1_dispatcher() -> Arc<RpcDispatcher> {
    let mut dispatcher = RpcDispatcher::new(
        "agent1",
        "platform.auth",
        Arc::new(PushedCapabilities::new()),
    );
    dispatcher.register_method("foo", &["can_call_foo"], &["x"], |_, args| async move {
        Ok(json!({"foo": args.get("x").cloned().unwrap_or(Value::Null)}))
    });
    Arc::new(dispatcher)
}

#[tokio::test]
async fn test_call_denied_until_capability_granted() {
    let server = TestServer::spawn(POLICY, "").await.expect("Failed to spawn test server");
    let addr = server.address();

    let agent1 = TestClient::login(&addr, "NULL", &[], "agent1").await.unwrap();
    let _serving = agent1.serve(agent1_dispatcher(), "platform.auth");
    let mut agent2 = TestClient::login(&addr, "PLAIN", &["agent2-key"], "agent2").await.unwrap();
    let mut admin = TestClient::login(&addr, "PLAIN", &["admin-key"], "admin").await.unwrap();

    let denied = agent2.rpc("agent1", "foo", json!({"x": 1})).await.unwrap();
    assert_eq!(denied["error"]["code"], "unauthorized");
    assert!(denied["error"]["message"].as_str().unwrap().contains("can_call_foo"));

    let granted = json!({
        "mechanism": "PLAIN",
        "credentials": "agent2-key",
        "user_id": "agent2",
        "identity": "agent2",
        "capabilities": {"can_call_foo": null}
    });
    let reply = admin
        .auth("auth_file.update_by_index", json!({"entry": granted, "index": 1}))
        .await
        .unwrap();
    assert!(reply.get("error").is_none(), "{reply}");

    // the new capabilities reach agent1 asynchronously
    let mut last = Value::Null;
    for _ in 0..50 {
        last = agent2.rpc("agent1", "foo", json!({"x": 1})).await.unwrap();
        if last.get("result").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(last["result"], json!({"foo": 1}));
}

#[tokio::test]
async fn test_argument_constraint_names_parameter() {
    let policy = POLICY.replace(
        r#""user_id": "agent2", "identity": "agent2""#,
        r#""user_id": "agent2", "identity": "agent2", "capabilities": {"can_call_foo": {"x": 1}}"#,
    );
    let server = TestServer::spawn(&policy, "").await.expect("Failed to spawn test server");
    let addr = server.address();

    let agent1 = TestClient::login(&addr, "NULL", &[], "agent1").await.unwrap();
    let _serving = agent1.serve(agent1_dispatcher(), "platform.auth");
    let mut agent2 = TestClient::login(&addr, "PLAIN", &["agent2-key"], "agent2").await.unwrap();

    let mut allowed = Value::Null;
    for _ in 0..50 {
        allowed = agent2.rpc("agent1", "foo", json!({"x": 1})).await.unwrap();
        if allowed.get("result").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(allowed["result"], json!({"foo": 1}));

    let mismatch = agent2.rpc("agent1", "foo", json!({"x": 42})).await.unwrap();
    assert_eq!(mismatch["error"]["code"], "unauthorized");
    let message = mismatch["error"]["message"].as_str().unwrap();
    assert!(message.contains("x"), "{message}");
    assert!(message.contains("42"), "{message}");
}

#[tokio::test]
async fn test_admin_surface_requires_modification_capability() {
    let server = TestServer::spawn(POLICY, "").await.expect("Failed to spawn test server");
    let addr = server.address();
    let mut agent2 = TestClient::login(&addr, "PLAIN", &["agent2-key"], "agent2").await.unwrap();
    let mut admin = TestClient::login(&addr, "PLAIN", &["admin-key"], "admin").await.unwrap();

    let refused = agent2
        .auth("auth_file.remove_by_index", json!({"index": 0}))
        .await
        .unwrap();
    assert_eq!(refused["error"]["code"], "unauthorized");

    let caps = admin.auth("get_capabilities", json!({"user_id": "admin"})).await.unwrap();
    assert_eq!(caps["result"], json!({"allow_auth_modifications": null}));

    let missing = agent2.auth("no_such_method", Value::Null).await.unwrap();
    assert_eq!(missing["error"]["code"], "unknown_method");

    let unreachable = agent2.rpc("nobody", "foo", Value::Null).await.unwrap();
    assert_eq!(unreachable["error"]["code"], "unreachable_peer");
}
