//! Tracing subscriber setup for the binary.
//!
//! `RUST_LOG` wins over the configured level when set.

use crate::error::{RigError, RigResult};
use tracing_subscriber::EnvFilter;

/// Builds the filter: `RUST_LOG` if present, `level` otherwise.
pub fn env_filter(level: &str) -> RigResult<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| RigError::Configuration(format!("Invalid log filter '{}': {}", level, e)))
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(level: &str, json: bool) -> RigResult<()> {
    let filter = env_filter(level)?;
    let installed = if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    };
    installed.map_err(|e| RigError::Configuration(format!("Logging already initialized: {}", e)))
}
