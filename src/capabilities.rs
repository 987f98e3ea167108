//! Capability protocol set.
//!
//! Every lifecycle behaviour an instrument may offer is its own single-method
//! trait. A service supports a capability when its matching accessor on
//! [`Service`] returns `Some`; there is no other declaration to keep in sync.
//!
//! ```text
//! Configure  ->  Initialize -> Test  ->  Pretest*  ->  Start -> Verify  ->  Stop -> Finalize  ->  Validate  ->  Shutdown
//! ```
//!
//! [`CapabilitySet`] is the bitmask computed once per instance (at
//! registration, or when a runner needs it) so dispatch never re-inspects a
//! service mid-pass.

use crate::config::ServiceSettings;
use crate::error::ServiceError;
use crate::service::Service;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for capability methods.
pub type CapabilityResult = Result<(), ServiceError>;

/// Capability for services that accept a settings table before use.
#[async_trait]
pub trait Configurable: Send + Sync {
    async fn configure(&self, settings: &ServiceSettings) -> CapabilityResult;
}

/// Capability for services that open connections or load state.
#[async_trait]
pub trait Initializable: Send + Sync {
    async fn initialize(&self) -> CapabilityResult;
}

/// Readiness check without side effects.
///
/// Returns [`ServiceError::NotReady`] when the device answers but is not ready;
/// any other error means the check itself could not run.
#[async_trait]
pub trait Testable: Send + Sync {
    async fn test(&self) -> CapabilityResult;
}

/// Check repeated before every acquisition (e.g. lick spout, sync lines).
#[async_trait]
pub trait Pretestable: Send + Sync {
    async fn pretest(&self) -> CapabilityResult;
}

/// Begins acquisition or playback.
#[async_trait]
pub trait Startable: Send + Sync {
    async fn start(&self) -> CapabilityResult;
}

/// Confirms a started service is actually acquiring.
#[async_trait]
pub trait Verifiable: Send + Sync {
    async fn verify(&self) -> CapabilityResult;
}

/// Ends what `start` began.
#[async_trait]
pub trait Stoppable: Send + Sync {
    async fn stop(&self) -> CapabilityResult;
}

/// Flushes and closes artifacts produced between start and stop.
#[async_trait]
pub trait Finalizable: Send + Sync {
    async fn finalize(&self) -> CapabilityResult;
}

/// Post-run sanity check of the produced data.
#[async_trait]
pub trait Validatable: Send + Sync {
    async fn validate(&self) -> CapabilityResult;
}

/// Releases persistent connections. Terminal.
#[async_trait]
pub trait Shutdownable: Send + Sync {
    async fn shutdown(&self) -> CapabilityResult;
}

/// Named optional behaviour a service may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Accepts a settings table.
    Configure,
    /// Opens connections or loads state.
    Initialize,
    /// Side-effect-free readiness check.
    Test,
    /// Check repeated before every acquisition.
    Pretest,
    /// Begins acquisition.
    Start,
    /// Confirms acquisition is running.
    Verify,
    /// Ends acquisition.
    Stop,
    /// Flushes and closes artifacts.
    Finalize,
    /// Checks the produced data.
    Validate,
    /// Releases persistent connections.
    Shutdown,
}

impl Capability {
    /// Every capability in lifecycle order.
    pub const ALL: [Capability; 10] = [
        Capability::Configure,
        Capability::Initialize,
        Capability::Test,
        Capability::Pretest,
        Capability::Start,
        Capability::Verify,
        Capability::Stop,
        Capability::Finalize,
        Capability::Validate,
        Capability::Shutdown,
    ];

    const fn bit(self) -> u16 {
        1 << (self as u16)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Configure => "configure",
            Capability::Initialize => "initialize",
            Capability::Test => "test",
            Capability::Pretest => "pretest",
            Capability::Start => "start",
            Capability::Verify => "verify",
            Capability::Stop => "stop",
            Capability::Finalize => "finalize",
            Capability::Validate => "validate",
            Capability::Shutdown => "shutdown",
        }
    }

    /// Whether `service` exposes this capability.
    pub fn is_supported_by<S: Service + ?Sized>(self, service: &S) -> bool {
        match self {
            Capability::Configure => service.as_configurable().is_some(),
            Capability::Initialize => service.as_initializable().is_some(),
            Capability::Test => service.as_testable().is_some(),
            Capability::Pretest => service.as_pretestable().is_some(),
            Capability::Start => service.as_startable().is_some(),
            Capability::Verify => service.as_verifiable().is_some(),
            Capability::Stop => service.as_stoppable().is_some(),
            Capability::Finalize => service.as_finalizable().is_some(),
            Capability::Validate => service.as_validatable().is_some(),
            Capability::Shutdown => service.as_shutdownable().is_some(),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dispatchable lifecycle stage. Each maps to exactly one capability.
///
/// Configure is absent: it takes an argument and runs as a pre-step of the
/// runner instead of being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Opens connections or loads state.
    Initialize,
    /// Side-effect-free readiness check.
    Test,
    /// Check repeated before every acquisition.
    Pretest,
    /// Begins acquisition.
    Start,
    /// Confirms acquisition is running.
    Verify,
    /// Ends acquisition.
    Stop,
    /// Flushes and closes artifacts.
    Finalize,
    /// Checks the produced data.
    Validate,
    /// Releases persistent connections.
    Shutdown,
}

impl Stage {
    /// Every stage in sequence order.
    pub const ALL: [Stage; 9] = [
        Stage::Initialize,
        Stage::Test,
        Stage::Pretest,
        Stage::Start,
        Stage::Verify,
        Stage::Stop,
        Stage::Finalize,
        Stage::Validate,
        Stage::Shutdown,
    ];

    pub fn capability(self) -> Capability {
        match self {
            Stage::Initialize => Capability::Initialize,
            Stage::Test => Capability::Test,
            Stage::Pretest => Capability::Pretest,
            Stage::Start => Capability::Start,
            Stage::Verify => Capability::Verify,
            Stage::Stop => Capability::Stop,
            Stage::Finalize => Capability::Finalize,
            Stage::Validate => Capability::Validate,
            Stage::Shutdown => Capability::Shutdown,
        }
    }

    /// Calls this stage's capability on `service`.
    ///
    /// Returns `None` when the service does not support it, so callers can
    /// skip without treating absence as an error.
    pub async fn invoke(self, service: &dyn Service) -> Option<CapabilityResult> {
        match self {
            Stage::Initialize => match service.as_initializable() {
                Some(cap) => Some(cap.initialize().await),
                None => None,
            },
            Stage::Test => match service.as_testable() {
                Some(cap) => Some(cap.test().await),
                None => None,
            },
            Stage::Pretest => match service.as_pretestable() {
                Some(cap) => Some(cap.pretest().await),
                None => None,
            },
            Stage::Start => match service.as_startable() {
                Some(cap) => Some(cap.start().await),
                None => None,
            },
            Stage::Verify => match service.as_verifiable() {
                Some(cap) => Some(cap.verify().await),
                None => None,
            },
            Stage::Stop => match service.as_stoppable() {
                Some(cap) => Some(cap.stop().await),
                None => None,
            },
            Stage::Finalize => match service.as_finalizable() {
                Some(cap) => Some(cap.finalize().await),
                None => None,
            },
            Stage::Validate => match service.as_validatable() {
                Some(cap) => Some(cap.validate().await),
                None => None,
            },
            Stage::Shutdown => match service.as_shutdownable() {
                Some(cap) => Some(cap.shutdown().await),
                None => None,
            },
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.capability().as_str())
    }
}

/// Bitmask of capabilities.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u16);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds a set in const context, for [`ServiceType`](crate::service::ServiceType) statics.
    pub const fn from_capabilities(caps: &[Capability]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < caps.len() {
            bits |= caps[i].bit();
            i += 1;
        }
        Self(bits)
    }

    /// Inspects the accessors of `service` once.
    pub fn of<S: Service + ?Sized>(service: &S) -> Self {
        Capability::ALL
            .into_iter()
            .filter(|cap| cap.is_supported_by(service))
            .collect()
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0 |= cap.bit();
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|cap| self.contains(*cap))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = CapabilitySet::empty();
        for cap in iter {
            set.insert(cap);
        }
        set
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|cap| cap.as_str()).collect();
        f.write_str(&names.join("|"))
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilitySet({})", self)
    }
}
