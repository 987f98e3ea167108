//! Custom error types for the orchestrator.
//!
//! Two layers of errors exist:
//!
//! - **`ServiceError`**: what a single capability call on a service returns. It
//!   separates the distinguished "device reachable but not ready" condition
//!   (`NotReady`) from infrastructure problems (anything else). The runner
//!   reports the two differently.
//! - **`RigError`**: the crate-level error surfaced to whoever drives a session.
//!   Every variant produced by a failed capability call carries the service
//!   name, the stage and the underlying cause, so an operator can fix the
//!   instrument and re-invoke the failed stage.
//!
//! Unsupported capabilities never produce an error; they are skipped.

use crate::capabilities::Stage;
use thiserror::Error;

/// Convenience alias for results using the orchestrator error type.
pub type RigResult<T> = std::result::Result<T, RigError>;

/// Error returned by a capability method of a service.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The device answered but failed its readiness check.
    #[error("not ready: {0}")]
    NotReady(String),

    /// Settings handed to `configure` did not match the service's schema.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// Any other failure (connection refused, I/O, vendor error...).
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl ServiceError {
    /// True for the distinguished test-failure kind.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, ServiceError::NotReady(_))
    }

    /// Short label used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::NotReady(_) => "test-failure",
            ServiceError::InvalidSettings(_) => "invalid-settings",
            ServiceError::Infrastructure(_) => "infrastructure",
        }
    }
}

/// One per-service failure collected during a best-effort stage.
#[derive(Debug)]
pub struct StageFailure {
    /// Name of the offending service.
    pub service: String,
    /// Stage during which it failed.
    pub stage: Stage,
    /// Underlying cause.
    pub error: ServiceError,
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed during {}: {}", self.service, self.stage, self.error)
    }
}

/// Primary error type for sessions, the runner and the registry.
#[derive(Error, Debug)]
pub enum RigError {
    /// A capability call failed.
    #[error("{service} failed during {stage} ({}): {source}", .source.kind())]
    Stage {
        service: String,
        stage: Stage,
        #[source]
        source: ServiceError,
    },

    /// Initialize+Test still failing after the last allowed attempt.
    #[error("{service} failed during {stage} after {attempts} attempts: {source}")]
    RetriesExhausted {
        service: String,
        stage: Stage,
        attempts: u32,
        #[source]
        source: ServiceError,
    },

    /// The intervention hook chose to stop retrying.
    #[error("{service} {stage} aborted by operator after {attempts} attempts: {source}")]
    Aborted {
        service: String,
        stage: Stage,
        attempts: u32,
        #[source]
        source: ServiceError,
    },

    /// Failures collected by a best-effort stage.
    #[error("Cleanup failed for {} service call(s): {}", .0.len(), summarize(.0))]
    CleanupFailed(Vec<StageFailure>),

    /// Session operation called out of order.
    #[error("Cannot {op} while session is {from}")]
    InvalidTransition { from: String, op: &'static str },

    /// No group with that name.
    #[error("Unknown service group '{0}'")]
    UnknownGroup(String),

    /// A group names a service missing from the session.
    #[error("Unknown service '{0}'")]
    UnknownService(String),

    /// Group is already open.
    #[error("Service group '{0}' is already started")]
    GroupAlreadyStarted(String),

    /// Group is not open.
    #[error("Service group '{0}' is not started")]
    GroupNotStarted(String),

    /// Handle refers to a freed or foreign slot.
    #[error("Service handle is stale or was never issued")]
    StaleHandle,

    /// Instance accessors disagree with the capabilities its type declares.
    #[error("Service '{service}' of type {service_type} declares [{declared}] but exposes [{exposed}]")]
    CapabilityMismatch {
        service: String,
        service_type: &'static str,
        declared: String,
        exposed: String,
    },

    /// A running-state watch ended with an error.
    #[error("Watching {service} failed: {source}")]
    Watch {
        service: String,
        #[source]
        source: ServiceError,
    },

    /// A wait exceeded its timeout.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem failure while collecting artifacts.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RigError {
    /// Name of the service responsible for the error, if any.
    pub fn service(&self) -> Option<&str> {
        match self {
            RigError::Stage { service, .. }
            | RigError::RetriesExhausted { service, .. }
            | RigError::Aborted { service, .. } => Some(service),
            RigError::CapabilityMismatch { service, .. } => Some(service),
            _ => None,
        }
    }

    /// Stage during which the error happened, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RigError::Stage { stage, .. }
            | RigError::RetriesExhausted { stage, .. }
            | RigError::Aborted { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

fn summarize(failures: &[StageFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
