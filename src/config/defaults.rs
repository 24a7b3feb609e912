//! Default value functions for configuration.
//!
//! Separated into its own module for clarity and reuse.

use std::net::SocketAddr;

// =============================================================================
// Server Defaults
// =============================================================================

pub fn default_instance_name() -> String {
    "capgate".to_string()
}

pub fn default_identity() -> String {
    "platform.auth".to_string()
}

pub fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 22916))
}

// =============================================================================
// Policy Defaults
// =============================================================================

pub fn default_auth_file() -> String {
    "auth.json".to_string()
}

pub fn default_protected_topics_file() -> String {
    "protected_topics.json".to_string()
}

pub fn default_reload_interval() -> u64 {
    5
}

pub fn default_watch_files() -> bool {
    true
}

// =============================================================================
// Handshake Defaults
// =============================================================================

pub fn default_max_backoff() -> u64 {
    100
}

// =============================================================================
// Propagation Defaults
// =============================================================================

pub fn default_startup_delay() -> u64 {
    3
}

pub fn default_peer_timeout() -> u64 {
    4
}

pub fn default_resync_interval() -> u64 {
    60
}
