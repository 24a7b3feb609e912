//! capgate - capability-based authentication and authorization gate.
//!
//! Peers connect through the [`gateway`], authenticate in the
//! [`handshake`] against a hot-reloaded policy ([`store`]), and are then
//! authorized per call ([`rpc`]) and per publish ([`topics`]). The
//! administrative surface lives in [`service`]; [`propagate`] keeps every
//! connected peer in step with the current policy.

pub mod config;
pub mod error;
pub mod gateway;
pub mod handshake;
pub mod index;
pub mod propagate;
pub mod reload;
pub mod rpc;
pub mod server;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod topics;
pub mod triage;

pub use error::{AuthError, AuthResult};
