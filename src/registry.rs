//! Registry of live service instances.
//!
//! An explicit arena: every service is registered once when it is built and
//! unregistered when it is torn down. Handles carry a generation so that a
//! handle to a freed slot is detected instead of silently aliasing whatever
//! was registered into the slot afterwards.
//!
//! Instances are indexed by their concrete [`ServiceType`]; the registry also
//! records the parent→child edges of every type it has seen so a query on a
//! base type can walk down to all subtypes.
//!
//! # Capability consistency
//!
//! At registration the instance's exposed capabilities are compared with the
//! ones its type declares. A mismatch is rejected, which keeps the type-level
//! check ([`ServiceType::declares`]), the instance-level check
//! ([`Service::supports`]) and [`ServiceRegistry::all_instances`] in agreement.

use crate::capabilities::{Capability, CapabilitySet};
use crate::error::{RigError, RigResult};
use crate::service::{ServiceType, SharedService};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

/// Generation-checked reference to a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceHandle {
    index: u32,
    generation: u32,
}

impl fmt::Display for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// Query result: the registered instance and what it supports.
#[derive(Clone)]
pub struct RegisteredService {
    pub handle: ServiceHandle,
    pub service: SharedService,
    pub capabilities: CapabilitySet,
}

impl fmt::Debug for RegisteredService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredService")
            .field("handle", &self.handle)
            .field("name", &self.service.name())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

struct Entry {
    service: SharedService,
    capabilities: CapabilitySet,
    seq: u64,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
pub struct ServiceRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_type: HashMap<&'static str, Vec<ServiceHandle>>,
    children: HashMap<&'static str, Vec<&'static ServiceType>>,
    next_seq: u64,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly built service.
    pub fn register(&mut self, service: SharedService) -> RigResult<ServiceHandle> {
        let service_type = service.service_type();
        let capabilities = service.capabilities();
        if capabilities != service_type.capabilities {
            return Err(RigError::CapabilityMismatch {
                service: service.name().to_string(),
                service_type: service_type.name,
                declared: service_type.capabilities.to_string(),
                exposed: capabilities.to_string(),
            });
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let handle = ServiceHandle {
            index,
            generation: slot.generation,
        };
        debug!(
            service = %service.name(),
            service_type = %service_type,
            capabilities = %capabilities,
            handle = %handle,
            "Registered service"
        );
        slot.entry = Some(Entry {
            service,
            capabilities,
            seq: self.next_seq,
        });
        self.next_seq += 1;

        self.by_type
            .entry(service_type.name)
            .or_default()
            .push(handle);
        self.record_lineage(service_type);
        Ok(handle)
    }

    /// Removes a service; its handle becomes stale.
    pub fn unregister(&mut self, handle: ServiceHandle) -> RigResult<SharedService> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(RigError::StaleHandle)?;
        let entry = slot.entry.take().ok_or(RigError::StaleHandle)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);

        let type_name = entry.service.service_type().name;
        if let Some(handles) = self.by_type.get_mut(type_name) {
            handles.retain(|h| *h != handle);
        }
        debug!(service = %entry.service.name(), handle = %handle, "Unregistered service");
        Ok(entry.service)
    }

    pub fn get(&self, handle: ServiceHandle) -> RigResult<SharedService> {
        self.entry(handle).map(|entry| entry.service.clone())
    }

    /// Instance-level capability check through the registry.
    pub fn supports(&self, handle: ServiceHandle, capability: Capability) -> RigResult<bool> {
        self.entry(handle)
            .map(|entry| entry.capabilities.contains(capability))
    }

    /// Live instances of `service_type`, optionally including every subtype
    /// and optionally restricted to those supporting `supporting`.
    ///
    /// Results are in registration order and each instance appears once, even
    /// when a subtype is reachable through several bases.
    pub fn all_instances(
        &self,
        service_type: &'static ServiceType,
        include_subtypes: bool,
        supporting: Option<Capability>,
    ) -> Vec<RegisteredService> {
        let mut visited_types = HashSet::new();
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        let mut pending = vec![service_type];

        while let Some(ty) = pending.pop() {
            if !visited_types.insert(ty.name) {
                continue;
            }
            for handle in self.by_type.get(ty.name).into_iter().flatten() {
                if seen.insert(*handle) {
                    found.push(*handle);
                }
            }
            if include_subtypes {
                if let Some(children) = self.children.get(ty.name) {
                    pending.extend(children.iter().copied());
                }
            }
        }

        self.collect(found, supporting)
    }

    /// Every live instance, optionally restricted to a capability.
    pub fn all(&self, supporting: Option<Capability>) -> Vec<RegisteredService> {
        let handles = self.handles();
        self.collect(handles, supporting)
    }

    pub fn handles(&self) -> Vec<ServiceHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(index, slot)| ServiceHandle {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, handle: ServiceHandle) -> RigResult<&Entry> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(RigError::StaleHandle)
    }

    fn collect(
        &self,
        handles: Vec<ServiceHandle>,
        supporting: Option<Capability>,
    ) -> Vec<RegisteredService> {
        let mut out: Vec<(u64, RegisteredService)> = handles
            .into_iter()
            .filter_map(|handle| {
                let entry = self.entry(handle).ok()?;
                if let Some(cap) = supporting {
                    if !entry.capabilities.contains(cap) {
                        return None;
                    }
                }
                Some((
                    entry.seq,
                    RegisteredService {
                        handle,
                        service: entry.service.clone(),
                        capabilities: entry.capabilities,
                    },
                ))
            })
            .collect();
        out.sort_by_key(|(seq, _)| *seq);
        out.into_iter().map(|(_, registered)| registered).collect()
    }

    fn record_lineage(&mut self, service_type: &'static ServiceType) {
        for base in service_type.bases {
            let children = self.children.entry(base.name).or_default();
            if !children.iter().any(|child| *child == service_type) {
                children.push(service_type);
            }
            self.record_lineage(base);
        }
    }
}
