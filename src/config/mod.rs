//! Configuration loading and management.
//!
//! This module is split into logical submodules:
//! - [`types`]: Core config struct definitions (Config and its sections)
//! - [`defaults`]: serde default functions
//! - [`validation`]: startup checks that collect every problem at once

mod defaults;
mod types;
mod validation;

pub use types::{
    Config, ConfigError, HandshakeConfig, LogFormat, LoggingConfig, PolicyConfig,
    PropagationConfig, ServerConfig,
};
pub use validation::{ValidationError, validate};
