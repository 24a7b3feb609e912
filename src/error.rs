//! Unified error handling for capgate.
//!
//! Every failure a caller can see (an RPC reply, a rejected publish, a
//! refused handshake) is an [`AuthError`]. Policy-file problems arrive
//! wrapped from [`capgate_policy::PolicyError`].

use capgate_policy::PolicyError;
use serde_json::{Value, json};
use thiserror::Error;

fn show_actual(actual: &Option<Value>) -> String {
    actual
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "<missing>".to_string())
}

/// Errors surfaced by the authentication service and its RPC surface.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Policy mutation or load failure.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// The caller holds none of the capabilities that allow the method.
    #[error(
        "method \"{method}\" requires capabilities {required:?}, but capability list {provided:?} was provided"
    )]
    Unauthorized {
        /// Method being called.
        method: String,
        /// Capabilities that individually allow the call.
        required: Vec<String>,
        /// Capabilities the caller holds.
        provided: Vec<String>,
    },

    /// The caller holds the capability only for other argument values.
    #[error(
        "User {user_id} can call method {method} only with {param}={required} but called with {param}={}",
        show_actual(.actual)
    )]
    ArgumentMismatch {
        /// Calling user.
        user_id: String,
        /// Method being called.
        method: String,
        /// Constrained parameter.
        param: String,
        /// Value the constraint requires.
        required: Value,
        /// Value supplied, if any.
        actual: Option<Value>,
    },

    /// Publishing to a write-protected topic without a required capability.
    #[error(
        "to publish to topic \"{topic}\" requires capabilities {required:?}, but capability list {provided:?} was provided"
    )]
    TopicUnauthorized {
        /// Topic published to.
        topic: String,
        /// Capabilities that protect the topic.
        required: Vec<String>,
        /// Capabilities the publisher holds.
        provided: Vec<String>,
    },

    /// A peer did not answer in time or is no longer connected.
    #[error("peer {peer} is unreachable: {reason}")]
    UnreachablePeer {
        /// Peer identity.
        peer: String,
        /// Timeout or disconnect reason.
        reason: String,
    },

    /// Malformed handshake or frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No such exported method.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// Arguments missing or of the wrong type.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// The remote side of a call reported an error.
    #[error("remote error ({code}): {message}")]
    Remote {
        /// Remote error code.
        code: String,
        /// Remote error message.
        message: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Get a static error code string for wire replies and log labels.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Policy(e) => e.error_code(),
            Self::Unauthorized { .. } => "unauthorized",
            Self::ArgumentMismatch { .. } => "unauthorized",
            Self::TopicUnauthorized { .. } => "unauthorized",
            Self::UnreachablePeer { .. } => "unreachable_peer",
            Self::Protocol(_) => "protocol_error",
            Self::UnknownMethod(_) => "unknown_method",
            Self::InvalidParams(_) => "invalid_params",
            Self::Remote { .. } => "remote_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the error is an authorization refusal.
    #[inline]
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Remote { code, .. } => code == "unauthorized",
            _ => self.error_code() == "unauthorized",
        }
    }

    /// Wire representation used in RPC error replies. Remote errors are
    /// relayed with their original code and message.
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Remote { code, message } => json!({ "code": code, "message": message }),
            _ => json!({ "code": self.error_code(), "message": self.to_string() }),
        }
    }

    /// Rebuild an error from its wire representation.
    pub fn from_wire(value: &Value) -> Self {
        let code = value
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("remote_error")
            .to_string();
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self::Remote { code, message }
    }
}

/// Result type for service operations.
pub type AuthResult<T> = Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_relays_unchanged() {
        let wire = json!({"code": "unauthorized", "message": "no"});
        let err = AuthError::from_wire(&wire);
        assert!(err.is_unauthorized());
        assert_eq!(err.to_wire(), wire);
    }

    #[test]
    fn test_unauthorized_message() {
        let err = AuthError::Unauthorized {
            method: "foo".into(),
            required: vec!["can_call_foo".into()],
            provided: vec![],
        };
        assert_eq!(
            err.to_string(),
            r#"method "foo" requires capabilities ["can_call_foo"], but capability list [] was provided"#
        );
        assert_eq!(err.error_code(), "unauthorized");
    }

    #[test]
    fn test_argument_mismatch_names_parameter() {
        let err = AuthError::ArgumentMismatch {
            user_id: "agent2".into(),
            method: "foo".into(),
            param: "x".into(),
            required: json!(1),
            actual: Some(json!(42)),
        };
        assert_eq!(
            err.to_string(),
            "User agent2 can call method foo only with x=1 but called with x=42"
        );
    }

    #[test]
    fn test_policy_errors_keep_their_code() {
        let err = AuthError::from(PolicyError::DuplicateMatch { indices: vec![0] });
        assert_eq!(err.error_code(), "duplicate_match");
    }

    #[test]
    fn test_wire_round_trip_is_remote() {
        let err = AuthError::UnknownMethod("nope".into());
        let back = AuthError::from_wire(&err.to_wire());
        assert!(matches!(back, AuthError::Remote { ref code, .. } if code == "unknown_method"));
    }
}
