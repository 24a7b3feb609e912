//! Error types for the policy model and policy file.

use thiserror::Error;

/// Convenience type alias for Results using [`PolicyError`].
pub type Result<T, E = PolicyError> = std::result::Result<T, E>;

/// Errors raised while parsing, validating, or persisting policy.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The policy file is not valid JSON (after comment stripping).
    #[error("policy file {path} is corrupt: {reason}")]
    Corrupt {
        /// File that failed to parse.
        path: String,
        /// Parser message.
        reason: String,
    },

    /// The policy file was written by a newer schema than this build understands.
    #[error("policy file version {major}.{minor} is newer than supported version {supported}")]
    VersionUnsupported {
        /// Major version found in the file.
        major: u64,
        /// Minor version found in the file.
        minor: u64,
        /// Highest version this build reads, as `major.minor`.
        supported: String,
    },

    /// Another entry already uses this user id.
    #[error("user_id {user_id} is already in use at index {index}")]
    DuplicateUserId {
        /// The contested user id.
        user_id: String,
        /// Index of the existing entry.
        index: usize,
    },

    /// Another entry already has identical domain, address, mechanism and credential.
    #[error("entry matches domain, address and credentials at indices {indices:?}")]
    DuplicateMatch {
        /// Indices of every conflicting entry.
        indices: Vec<usize>,
    },

    /// An index passed to remove/update is outside the entry list.
    #[error("invalid index {index} (policy has {len} entries)")]
    IndexOutOfRange {
        /// Offending index.
        index: usize,
        /// Number of entries at the time of the call.
        len: usize,
    },

    /// A group, role or capability value has the wrong shape.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An entry failed field validation (mechanism, credential, pattern).
    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    /// A `/.../` wildcard did not compile as a regular expression.
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// The raw field value.
        pattern: String,
        /// Regex compiler error.
        #[source]
        source: regex::Error,
    },

    /// Mechanism string is not one of NULL, PLAIN, CURVE.
    #[error("unknown mechanism {0:?}, expected NULL, PLAIN or CURVE")]
    UnknownMechanism(String),

    /// Filesystem failure while reading, writing or backing up the file.
    #[error("policy file I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure while writing the file.
    #[error("policy serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl PolicyError {
    /// Get a static error code string for wire replies and log labels.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Corrupt { .. } => "policy_corrupt",
            Self::VersionUnsupported { .. } => "policy_version_unsupported",
            Self::DuplicateUserId { .. } => "duplicate_user_id",
            Self::DuplicateMatch { .. } => "duplicate_match",
            Self::IndexOutOfRange { .. } => "index_out_of_range",
            Self::Validation(_) => "validation_error",
            Self::InvalidEntry(_) => "invalid_entry",
            Self::InvalidPattern { .. } => "invalid_pattern",
            Self::UnknownMechanism(_) => "unknown_mechanism",
            Self::Io(_) => "io_error",
            Self::Serialize(_) => "serialize_error",
        }
    }
}
