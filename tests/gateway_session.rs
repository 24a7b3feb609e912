//! Integration tests for gateway sessions and policy fan-out.

mod common;

use common::{TestClient, TestServer};
use serde_json::json;

const POLICY: &str = r#"{
    "version": {"major": 1, "minor": 3},
    "allow": [
        {"mechanism": "PLAIN", "credentials": "weather-key", "user_id": "weather", "identity": "weather",
         "capabilities": {"can_read": null},
         "rpc_method_authorizations": {"forecast": ["can_read"]}},
        {"mechanism": "PLAIN", "credentials": "other-key", "user_id": "other"}
    ]
}"#;

#[tokio::test]
async fn test_join_receives_capability_map_and_allowances() {
    let server = TestServer::spawn(POLICY, "").await.expect("Failed to spawn test server");
    let mut weather = TestClient::login(&server.address(), "PLAIN", &["weather-key"], "weather")
        .await
        .unwrap();

    let update = weather
        .recv_until(|f| f["type"] == "notify" && f["method"] == "auth.update")
        .await
        .unwrap();
    assert_eq!(update["params"]["user_to_caps"]["weather"], json!({"can_read": null}));

    let push = weather
        .recv_until(|f| f["type"] == "call" && f["method"] == "auth.set_multiple_rpc_authorizations")
        .await
        .unwrap();
    assert_eq!(push["caller"], "platform.auth");
    assert_eq!(
        push["params"]["rpc_authorizations"],
        json!({"forecast": ["can_read"]})
    );
    weather.answer(push["id"].as_u64().unwrap(), json!(null)).await.unwrap();
}

#[tokio::test]
async fn test_identity_is_unique_per_session() {
    let server = TestServer::spawn(POLICY, "").await.expect("Failed to spawn test server");
    let addr = server.address();
    let _first = TestClient::login(&addr, "PLAIN", &["other-key"], "dup").await.unwrap();

    let mut second = TestClient::connect(&addr).await.unwrap();
    let answer = second.hello("PLAIN", &["other-key"], Some("dup")).await.unwrap();
    assert_eq!(answer["type"], "denied");

    let mut reserved = TestClient::connect(&addr).await.unwrap();
    let answer = reserved
        .hello("PLAIN", &["other-key"], Some("platform.auth"))
        .await
        .unwrap();
    assert_eq!(answer["type"], "denied");
}

#[tokio::test]
async fn test_identity_defaults_to_user_id() {
    let server = TestServer::spawn(POLICY, "").await.expect("Failed to spawn test server");
    let mut client = TestClient::connect(&server.address()).await.unwrap();
    let welcome = client.hello("PLAIN", &["other-key"], None).await.unwrap();
    assert_eq!(welcome["type"], "welcome");
    assert_eq!(welcome["identity"], "other");

    client.send(json!({"type": "bogus"})).await.unwrap();
    let error = client.recv_until(|f| f["type"] == "error").await.unwrap();
    assert!(error["message"].as_str().unwrap().contains("malformed"));
}

#[tokio::test]
async fn test_external_policy_edit_is_pushed() {
    let server = TestServer::spawn(POLICY, "").await.expect("Failed to spawn test server");
    let mut other = TestClient::login(&server.address(), "PLAIN", &["other-key"], "other")
        .await
        .unwrap();

    std::thread::sleep(std::time::Duration::from_millis(20));
    let edited = POLICY.replace(
        r#""user_id": "other"}"#,
        r#""user_id": "other", "capabilities": {"can_write": null}}"#,
    );
    std::fs::write(server.auth_file(), edited).unwrap();

    let update = other
        .recv_until(|f| {
            f["type"] == "notify"
                && f["method"] == "auth.update"
                && f["params"]["user_to_caps"]["other"] == json!({"can_write": null})
        })
        .await
        .unwrap();
    assert_eq!(update["params"]["user_to_caps"]["weather"], json!({"can_read": null}));
}
