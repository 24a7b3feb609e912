//! Logging setup and audit helpers.

use crate::config::LogFormat;
use capgate_policy::Mechanism;
use tracing_subscriber::EnvFilter;

/// Characters of a secret credential that may appear in logs.
pub const CREDENTIAL_LOG_PREFIX: usize = 8;

/// Install the global subscriber. Filtering follows `RUST_LOG` (default `info`).
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Loggable form of a handshake credential.
///
/// PLAIN and CURVE credentials are cut to a short prefix; NULL has none.
pub fn credential_prefix(mechanism: Mechanism, credential: Option<&str>) -> String {
    match credential {
        None => "-".to_string(),
        Some(c) if !mechanism.has_secret_credential() => c.to_string(),
        Some(c) => {
            let prefix: String = c.chars().take(CREDENTIAL_LOG_PREFIX).collect();
            if prefix.len() < c.len() {
                format!("{prefix}...")
            } else {
                prefix
            }
        }
    }
}

/// Standardized span constructors.
pub mod spans {
    use tracing::{Span, info_span};

    /// Span for a gateway session.
    pub fn session(addr: &str) -> Span {
        info_span!("session", addr = %addr)
    }

    /// Span for an RPC dispatch.
    pub fn rpc(component: &str, method: &str, caller: Option<&str>) -> Span {
        match caller {
            Some(caller) => info_span!("rpc", component = %component, method = %method, caller = %caller),
            None => info_span!("rpc", component = %component, method = %method),
        }
    }
}
