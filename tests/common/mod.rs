//! Integration test common infrastructure.
//!
//! Provides an in-process test server on a temporary policy directory and a
//! line-JSON test peer.

pub mod client;
pub mod server;

#[allow(unused_imports)]
pub use client::TestClient;
#[allow(unused_imports)]
pub use server::TestServer;
