//! Core library for the rig orchestrator.
//!
//! Coordinates a data-collection session across heterogeneous lab instruments.
//! Each instrument is a [`Service`](service::Service) exposing a subset of the
//! lifecycle capabilities; the [`LifecycleRunner`](runner::LifecycleRunner)
//! dispatches stages purely on capability, and an
//! [`ExperimentSession`](session::ExperimentSession) sequences a whole run:
//!
//! ```text
//! configure -> initialize+test -> { pretest -> start -> verify -> stop -> finalize } -> shutdown
//! ```
//!
//! A service missing a capability is skipped. A started group is always
//! stopped, including when a later step fails.

pub mod capabilities;
pub mod config;
pub mod data_files;
pub mod error;
pub mod instruments;
pub mod logging;
pub mod registry;
pub mod runner;
pub mod service;
pub mod session;
pub mod status;
pub mod watcher;

pub use capabilities::{Capability, CapabilityResult, CapabilitySet, Stage};
pub use config::{ConfigMap, RigConfig, ServiceSettings};
pub use error::{RigError, RigResult, ServiceError};
pub use registry::{ServiceHandle, ServiceRegistry};
pub use runner::{CleanupReport, LifecycleRunner, RetryPolicy};
pub use service::{Service, ServiceType, SharedService};
pub use session::{ExperimentSession, SessionContext, SessionStage};
pub use status::ComponentStatus;
