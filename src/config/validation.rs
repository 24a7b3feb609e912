//! Configuration validation.
//!
//! Validates configuration at startup to catch common errors early.

use super::Config;
use std::path::Path;
use thiserror::Error;

/// Validation errors for configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("server.identity is required")]
    MissingIdentity,
    #[error("policy.reload_interval_secs must be at least 1")]
    ZeroReloadInterval,
    #[error("handshake.max_backoff_secs must be at least 1")]
    BackoffTooSmall,
    #[error("propagation.peer_timeout_secs must be at least 1")]
    ZeroPeerTimeout,
    #[error("propagation.resync_interval_secs must be at least 1")]
    ZeroResyncInterval,
    #[error("handshake.allow_any and handshake.setup_mode are mutually exclusive")]
    ConflictingHandshakeModes,
    #[error("policy.auth_file parent directory does not exist: {0}")]
    AuthFilePathInvalid(String),
    #[error("policy.protected_topics_file parent directory does not exist: {0}")]
    TopicsFilePathInvalid(String),
}

fn parent_missing(path: &str) -> bool {
    Path::new(path)
        .parent()
        .is_some_and(|parent| !parent.as_os_str().is_empty() && !parent.exists())
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.identity.trim().is_empty() {
        errors.push(ValidationError::MissingIdentity);
    }
    if config.policy.reload_interval_secs == 0 {
        errors.push(ValidationError::ZeroReloadInterval);
    }
    if config.handshake.max_backoff_secs == 0 {
        errors.push(ValidationError::BackoffTooSmall);
    }
    if config.propagation.peer_timeout_secs == 0 {
        errors.push(ValidationError::ZeroPeerTimeout);
    }
    if config.propagation.resync_interval_secs == 0 {
        errors.push(ValidationError::ZeroResyncInterval);
    }
    if config.handshake.allow_any && config.handshake.setup_mode {
        errors.push(ValidationError::ConflictingHandshakeModes);
    }

    // File locations
    if parent_missing(&config.policy.auth_file) {
        errors.push(ValidationError::AuthFilePathInvalid(
            config.policy.auth_file.clone(),
        ));
    }
    if parent_missing(&config.policy.protected_topics_file) {
        errors.push(ValidationError::TopicsFilePathInvalid(
            config.policy.protected_topics_file.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
