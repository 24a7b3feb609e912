//! Integration tests for write-protected pub/sub topics.

mod common;

use common::{TestClient, TestServer};
use serde_json::json;
use std::time::Duration;

const POLICY: &str = r#"{
    "version": {"major": 1, "minor": 3},
    "allow": [
        {"mechanism": "PLAIN", "credentials": "driver-key", "user_id": "driver"},
        {"mechanism": "PLAIN", "credentials": "listener-key", "user_id": "listener"},
        {"mechanism": "PLAIN", "credentials": "admin-key", "user_id": "admin",
         "capabilities": {"allow_auth_modifications": null}}
    ]
}"#;

const TOPICS: &str = r#"{
    "write-protect": [
        {"topic": "devices", "capabilities": ["can_publish_devices"]},
        {"topic": "/record/.*/", "capabilities": ["can_publish_records"]}
    ]
}"#;

#[tokio::test]
async fn test_publish_requires_topic_capability() {
    let server = TestServer::spawn(POLICY, TOPICS).await.expect("Failed to spawn test server");
    let addr = server.address();

    let mut driver = TestClient::login(&addr, "PLAIN", &["driver-key"], "driver").await.unwrap();
    let mut listener = TestClient::login(&addr, "PLAIN", &["listener-key"], "listener").await.unwrap();
    let mut admin = TestClient::login(&addr, "PLAIN", &["admin-key"], "admin").await.unwrap();
    listener.subscribe("devices").await.unwrap();

    let refused = driver
        .publish("devices/campus/building/point", json!({"value": 72}))
        .await
        .unwrap();
    assert_eq!(refused["error"]["code"], "unauthorized");
    let message = refused["error"]["message"].as_str().unwrap();
    assert!(message.contains("devices/campus/building/point"), "{message}");
    assert!(message.contains("can_publish_devices"), "{message}");

    let granted = json!({
        "mechanism": "PLAIN",
        "credentials": "driver-key",
        "user_id": "driver",
        "capabilities": {"can_publish_devices": null}
    });
    admin
        .auth("auth_file.update_by_index", json!({"entry": granted, "index": 0}))
        .await
        .unwrap();

    // permissions arrive through the propagator
    let permissions = driver
        .recv_until(|f| {
            f["type"] == "notify"
                && f["method"] == "pubsub.permissions"
                && f["params"] == json!(["devices"])
        })
        .await
        .unwrap();
    assert_eq!(permissions["params"], json!(["devices"]));

    let accepted = driver
        .publish("devices/campus/building/point", json!({"value": 72}))
        .await
        .unwrap();
    assert_eq!(accepted["result"], 1);

    let delivered = listener
        .recv_until(|f| f["type"] == "message")
        .await
        .unwrap();
    assert_eq!(delivered["topic"], "devices/campus/building/point");
    assert_eq!(delivered["sender"], "driver");
    assert_eq!(delivered["message"], json!({"value": 72}));
}

#[tokio::test]
async fn test_regex_rule_and_open_topics() {
    let server = TestServer::spawn(POLICY, TOPICS).await.expect("Failed to spawn test server");
    let addr = server.address();
    let mut driver = TestClient::login(&addr, "PLAIN", &["driver-key"], "driver").await.unwrap();

    let refused = driver.publish("record/x", json!(1)).await.unwrap();
    assert_eq!(refused["error"]["code"], "unauthorized");
    let open = driver.publish("heartbeat/driver", json!(1)).await.unwrap();
    assert_eq!(open["result"], 0);
}

#[tokio::test]
async fn test_topics_file_is_hot_reloaded() {
    let server = TestServer::spawn(POLICY, "").await.expect("Failed to spawn test server");
    let addr = server.address();
    let mut driver = TestClient::login(&addr, "PLAIN", &["driver-key"], "driver").await.unwrap();
    assert!(driver.publish("alerts/fire", json!(1)).await.unwrap().get("result").is_some());

    let topics_file = server.auth_file().with_file_name("protected_topics.json");
    std::fs::write(
        &topics_file,
        r#"{"write-protect": [{"topic": "alerts", "capabilities": ["can_alert"]}]}"#,
    )
    .unwrap();

    let mut last = json!(null);
    for _ in 0..40 {
        last = driver.publish("alerts/fire", json!(1)).await.unwrap();
        if last.get("error").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(last["error"]["code"], "unauthorized");
}
