//! The service contract every rig instrument implements.
//!
//! A service is a long-lived, process-wide object shared across sessions
//! (`Arc<dyn Service>`). Its capabilities are discovered through the `as_*`
//! accessors; the defaults return `None`, so an implementation only overrides
//! what it actually supports.
//!
//! Each concrete service also points at a static [`ServiceType`] describing its
//! type lineage. Lineage drives configuration layering (base types first) and
//! registry queries that include subtypes.

use crate::capabilities::{
    Capability, CapabilitySet, Configurable, Finalizable, Initializable, Pretestable, Shutdownable,
    Startable, Stoppable, Testable, Validatable, Verifiable,
};
use crate::data_files::DataProducer;
use std::fmt;
use std::sync::Arc;

/// Shared handle to a service.
pub type SharedService = Arc<dyn Service>;

/// A lab instrument (or software agent) taking part in a session.
pub trait Service: Send + Sync {
    /// Stable identifier, used for configuration lookup and status reporting.
    fn name(&self) -> &str;

    /// Static type descriptor of the concrete service.
    fn service_type(&self) -> &'static ServiceType;

    fn as_configurable(&self) -> Option<&dyn Configurable> {
        None
    }

    fn as_initializable(&self) -> Option<&dyn Initializable> {
        None
    }

    fn as_testable(&self) -> Option<&dyn Testable> {
        None
    }

    fn as_pretestable(&self) -> Option<&dyn Pretestable> {
        None
    }

    fn as_startable(&self) -> Option<&dyn Startable> {
        None
    }

    fn as_verifiable(&self) -> Option<&dyn Verifiable> {
        None
    }

    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        None
    }

    fn as_finalizable(&self) -> Option<&dyn Finalizable> {
        None
    }

    fn as_validatable(&self) -> Option<&dyn Validatable> {
        None
    }

    fn as_shutdownable(&self) -> Option<&dyn Shutdownable> {
        None
    }

    /// Artifact listing, for services that write files. Never used by the runner.
    fn as_data_producer(&self) -> Option<&dyn DataProducer> {
        None
    }

    /// Capabilities this instance exposes.
    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(self)
    }

    fn supports(&self, capability: Capability) -> bool {
        capability.is_supported_by(self)
    }
}

impl fmt::Debug for dyn Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name())
            .field("type", &self.service_type().name)
            .finish()
    }
}

/// Static type descriptor with declared base types.
///
/// Type names must be unique within a process: they are the identity used by
/// the registry and the configuration keys.
///
/// ```rust,ignore
/// pub static CAMERA: ServiceType = ServiceType::root("Camera", CapabilitySet::empty());
/// pub static VIDEO_CAMERA: ServiceType = ServiceType {
///     name: "VideoCamera",
///     bases: &[&CAMERA],
///     capabilities: CapabilitySet::from_capabilities(&[Capability::Start, Capability::Stop]),
/// };
/// ```
pub struct ServiceType {
    pub name: &'static str,
    pub bases: &'static [&'static ServiceType],
    /// Capabilities every instance of this type exposes.
    pub capabilities: CapabilitySet,
}

impl ServiceType {
    pub const fn root(name: &'static str, capabilities: CapabilitySet) -> Self {
        Self {
            name,
            bases: &[],
            capabilities,
        }
    }

    /// Type-level capability check.
    pub fn declares(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }

    /// Reflexive, transitive subtype check.
    pub fn is_subtype_of(&self, other: &ServiceType) -> bool {
        self == other || self.bases.iter().any(|base| base.is_subtype_of(other))
    }

    /// Ancestors linearized most general first, ending with `self`.
    ///
    /// A type reachable through several bases appears once, at its first
    /// position.
    pub fn lineage(&'static self) -> Vec<&'static ServiceType> {
        let mut out = Vec::new();
        self.collect_lineage(&mut out);
        out
    }

    fn collect_lineage(&'static self, out: &mut Vec<&'static ServiceType>) {
        for base in self.bases {
            base.collect_lineage(out);
        }
        if !out.iter().any(|seen| *seen == self) {
            out.push(self);
        }
    }
}

impl PartialEq for ServiceType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ServiceType {}

impl fmt::Debug for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bases: Vec<&str> = self.bases.iter().map(|b| b.name).collect();
        f.debug_struct("ServiceType")
            .field("name", &self.name)
            .field("bases", &bases)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
