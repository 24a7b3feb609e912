//! Handshake authentication mechanisms.

use crate::error::PolicyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a base64 (URL-safe, unpadded) encoded 32-byte CURVE public key.
pub const ENCODED_CURVE_KEY_LEN: usize = 43;

/// The security mechanism a peer used for its handshake.
///
/// The wire names are the ZAP names: `NULL` (no credential), `PLAIN`
/// (password) and `CURVE` (public key).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mechanism {
    /// No authentication; the credential is ignored.
    #[serde(rename = "NULL")]
    Null,
    /// Username/password.
    #[serde(rename = "PLAIN")]
    Plain,
    /// Encoded CURVE public key.
    #[default]
    #[serde(rename = "CURVE")]
    Curve,
}

impl Mechanism {
    /// Wire name of the mechanism.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Plain => "PLAIN",
            Self::Curve => "CURVE",
        }
    }

    /// Whether credentials for this mechanism are secrets that must not be logged in full.
    #[inline]
    pub fn has_secret_credential(&self) -> bool {
        !matches!(self, Self::Null)
    }
}

impl FromStr for Mechanism {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NULL" => Ok(Self::Null),
            "PLAIN" => Ok(Self::Plain),
            "CURVE" => Ok(Self::Curve),
            other => Err(PolicyError::UnknownMechanism(other.to_string())),
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
