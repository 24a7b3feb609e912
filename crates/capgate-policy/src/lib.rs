//! # capgate-policy
//!
//! The authorization policy model used by the capgate daemon.
//!
//! ## Contents
//!
//! - [`PolicyEntry`]: one allow rule (who may connect, and with which capabilities)
//! - [`Pattern`]: exact-or-regex field values (`/regex/` convention), compiled once
//! - [`Capabilities`]: capability name to optional argument constraint
//! - [`PolicyDocument`]: the in-memory policy (allow/deny entries, groups, roles)
//! - [`PolicyFile`]: the versioned JSON file with its upgrade chain
//!
//! This crate is transport-free and does no locking. The daemon wraps a
//! [`PolicyFile`] in a single-writer store.
//!
//! ## Example
//!
//! ```rust
//! use capgate_policy::{Mechanism, PolicyEntry};
//!
//! let entry = PolicyEntry::builder(Mechanism::Plain)
//!     .credential("secret")
//!     .address("/192\\.168\\.1\\..*/")
//!     .user_id("sensor-7")
//!     .build()
//!     .unwrap();
//!
//! assert!(entry.matches("vip", "192.168.1.20", Mechanism::Plain, &["secret"]));
//! assert!(!entry.matches("vip", "10.0.0.1", Mechanism::Plain, &["secret"]));
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod capability;
pub mod comments;
pub mod document;
pub mod entry;
pub mod error;
pub mod file;
pub mod mechanism;
pub mod pattern;
mod upgrade;
pub mod user;

pub use self::capability::{values_equal, Capabilities, Constraint};
pub use self::document::{AddOutcome, EntryList, Groups, PolicyDocument, Roles};
pub use self::entry::{EntryBuilder, PolicyEntry};
pub use self::error::{PolicyError, Result};
pub use self::file::{PolicyFile, PolicyVersion, CURRENT_VERSION};
pub use self::mechanism::Mechanism;
pub use self::pattern::{literal_field, Pattern};
pub use self::user::{dump_user, load_user};
