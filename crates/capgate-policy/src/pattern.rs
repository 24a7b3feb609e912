//! Exact-or-regex field values.
//!
//! A policy field wrapped in slashes (`/192\.168\..*/`) is a regular
//! expression that must match the whole input; anything else is compared
//! for string equality. The decision is made once at parse time.

use crate::error::PolicyError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Returns true if `value` uses the `/regex/` convention.
#[inline]
pub fn is_regex(value: &str) -> bool {
    value.len() > 1 && value.starts_with('/') && value.ends_with('/')
}

/// Field text that matches exactly `value` when parsed.
///
/// Observed values that happen to look like `/regex/` are escaped so an
/// enrolled entry never widens into a pattern.
pub fn literal_field(value: &str) -> String {
    if is_regex(value) {
        format!("/{}/", regex::escape(value))
    } else {
        value.to_string()
    }
}

/// A parsed policy field.
#[derive(Clone)]
pub enum Pattern {
    /// Literal value, compared with `==`.
    Exact(String),
    /// Compiled full-match regular expression, with its original `/.../` text.
    Regex {
        /// The field text as written in the file, slashes included.
        source: String,
        /// The anchored, compiled expression.
        regex: Regex,
    },
}

impl Pattern {
    /// Parse a field value, compiling it if it is a `/regex/`.
    pub fn parse(value: &str) -> Result<Self, PolicyError> {
        if is_regex(value) {
            let inner = &value[1..value.len() - 1];
            let regex = Regex::new(&format!("^(?:{inner})$")).map_err(|source| {
                PolicyError::InvalidPattern {
                    pattern: value.to_string(),
                    source,
                }
            })?;
            Ok(Self::Regex {
                source: value.to_string(),
                regex,
            })
        } else {
            Ok(Self::Exact(value.to_string()))
        }
    }

    /// A literal pattern, never interpreted as a regex.
    pub fn exact(value: impl Into<String>) -> Self {
        Self::Exact(value.into())
    }

    /// The field text as written.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Exact(s) => s,
            Self::Regex { source, .. } => source,
        }
    }

    /// Whether this is a regex pattern.
    #[inline]
    pub fn is_regex(&self) -> bool {
        matches!(self, Self::Regex { .. })
    }

    /// Match a concrete value against this pattern.
    #[inline]
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Exact(s) => s == value,
            Self::Regex { regex, .. } => regex.is_match(value),
        }
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Pattern {}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(s) => f.debug_tuple("Exact").field(s).finish(),
            Self::Regex { source, .. } => f.debug_tuple("Regex").field(source).finish(),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Pattern::parse(&raw).map_err(serde::de::Error::custom)
    }
}
