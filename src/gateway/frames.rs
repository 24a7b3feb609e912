//! Line-JSON frames exchanged with gateway peers.
//!
//! One JSON object per line, tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent by a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Handshake; must be the first frame.
    Hello {
        #[serde(default)]
        domain: String,
        mechanism: String,
        #[serde(default)]
        credentials: Vec<String>,
        /// Routing identity; defaults to the granted user id.
        #[serde(default)]
        identity: Option<String>,
    },
    /// Call `method` on `peer`.
    Rpc {
        id: u64,
        peer: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// Successful answer to a forwarded [`ServerFrame::Call`].
    Result {
        id: u64,
        #[serde(default)]
        result: Value,
    },
    /// Failed answer to a forwarded [`ServerFrame::Call`].
    Error { id: u64, error: Value },
    Subscribe { prefix: String },
    Publish {
        #[serde(default)]
        id: Option<u64>,
        topic: String,
        #[serde(default)]
        message: Value,
    },
}

/// Frames sent to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome { user_id: String, identity: String },
    Denied { reason: String },
    /// Answer to a peer's `rpc` or `publish`.
    Reply {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
    /// A call the peer must answer with `result` or `error`. `caller` is
    /// the user id granted to the calling peer.
    Call {
        id: u64,
        caller: String,
        method: String,
        params: Value,
    },
    /// One-way method invocation (`auth.update`, `pubsub.permissions`).
    Notify { method: String, params: Value },
    Message {
        topic: String,
        sender: String,
        message: Value,
    },
    /// Frame-level problem; the session stays open.
    Error { message: String },
}
