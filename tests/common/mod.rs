//! Common test utilities for rig_orchestrator integration tests
//!
//! - [`CallLog`]: ordered record of every capability call
//! - [`ScriptedService`]: a service whose capability set and failures are
//!   chosen per test

#![allow(dead_code)] // Utilities may not all be used by every test binary

use async_trait::async_trait;
use rig_orchestrator::capabilities::{
    Capability, CapabilityResult, CapabilitySet, Configurable, Finalizable, Initializable,
    Pretestable, Shutdownable, Stage, Startable, Stoppable, Testable, Validatable, Verifiable,
};
use rig_orchestrator::config::ServiceSettings;
use rig_orchestrator::error::ServiceError;
use rig_orchestrator::service::{Service, ServiceType, SharedService};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Shared, ordered record of `"<service>.<stage>"` entries.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, service: &str, what: &str) {
        self.0.lock().unwrap().push(format!("{}.{}", service, what));
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Entries recorded against one service.
    pub fn calls_for(&self, service: &str) -> Vec<String> {
        let prefix = format!("{}.", service);
        self.entries()
            .into_iter()
            .filter(|entry| entry.starts_with(&prefix))
            .collect()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Failure kinds a script can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    NotReady,
    Infrastructure,
}

impl Fault {
    fn error(self, service: &str, stage: Stage) -> ServiceError {
        match self {
            Fault::NotReady => ServiceError::NotReady(format!("{} not ready for {}", service, stage)),
            Fault::Infrastructure => {
                anyhow::anyhow!("{} lost its connection during {}", service, stage).into()
            }
        }
    }
}

/// Service type with exactly `capabilities` declared. Leaked, test-only.
pub fn scripted_type(capabilities: CapabilitySet) -> &'static ServiceType {
    leak_type(format!("Scripted[{}]", capabilities), &[], capabilities)
}

/// Leaks a type descriptor so it can be referenced as `&'static`.
pub fn leak_type(
    name: String,
    bases: &[&'static ServiceType],
    capabilities: CapabilitySet,
) -> &'static ServiceType {
    let bases: &'static [&'static ServiceType] = Box::leak(bases.to_vec().into_boxed_slice());
    Box::leak(Box::new(ServiceType {
        name: Box::leak(name.into_boxed_str()),
        bases,
        capabilities,
    }))
}

/// A service whose capabilities are exactly those of its type.
pub struct ScriptedService {
    name: String,
    service_type: &'static ServiceType,
    log: CallLog,
    /// Remaining failures per stage; `None` means fail forever.
    faults: Mutex<HashMap<Stage, (Fault, Option<u32>)>>,
    reject_settings: bool,
    attributes: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl ScriptedService {
    pub fn new(name: &str, capabilities: &[Capability], log: &CallLog) -> Arc<Self> {
        Self::with_type(
            name,
            scripted_type(CapabilitySet::from_capabilities(capabilities)),
            log,
        )
    }

    pub fn with_type(name: &str, service_type: &'static ServiceType, log: &CallLog) -> Arc<Self> {
        Arc::new(Self::build(name, service_type, log, false))
    }

    /// Configurable service that refuses any settings.
    pub fn rejecting(name: &str, log: &CallLog) -> Arc<Self> {
        let ty = scripted_type(CapabilitySet::from_capabilities(&[Capability::Configure]));
        Arc::new(Self::build(name, ty, log, true))
    }

    fn build(name: &str, service_type: &'static ServiceType, log: &CallLog, reject: bool) -> Self {
        Self {
            name: name.to_string(),
            service_type,
            log: log.clone(),
            faults: Mutex::new(HashMap::new()),
            reject_settings: reject,
            attributes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Fails the next `times` calls of `stage`.
    pub fn fail_times(&self, stage: Stage, fault: Fault, times: u32) -> &Self {
        self.faults
            .lock()
            .unwrap()
            .insert(stage, (fault, Some(times)));
        self
    }

    pub fn fail_always(&self, stage: Stage, fault: Fault) -> &Self {
        self.faults.lock().unwrap().insert(stage, (fault, None));
        self
    }

    pub fn attribute(&self, key: &str) -> Option<serde_json::Value> {
        self.attributes.lock().unwrap().get(key).cloned()
    }

    pub fn attributes(&self) -> BTreeMap<String, serde_json::Value> {
        self.attributes.lock().unwrap().clone()
    }

    pub fn shared(self: &Arc<Self>) -> SharedService {
        self.clone()
    }

    fn call(&self, stage: Stage) -> CapabilityResult {
        self.log.record(&self.name, stage.to_string().as_str());
        let mut faults = self.faults.lock().unwrap();
        let Some((fault, remaining)) = faults.get_mut(&stage) else {
            return Ok(());
        };
        let fault = *fault;
        match remaining {
            None => Err(fault.error(&self.name, stage)),
            Some(0) => Ok(()),
            Some(n) => {
                *n -= 1;
                Err(fault.error(&self.name, stage))
            }
        }
    }

    fn has(&self, capability: Capability) -> bool {
        self.service_type.declares(capability)
    }
}

#[async_trait]
impl Configurable for ScriptedService {
    async fn configure(&self, settings: &ServiceSettings) -> CapabilityResult {
        self.log.record(&self.name, "configure");
        if self.reject_settings {
            return Err(ServiceError::InvalidSettings(format!(
                "{} accepts no settings",
                self.name
            )));
        }
        let mut attributes = self.attributes.lock().unwrap();
        for key in settings.keys() {
            if let Some(value) = settings.get(key) {
                attributes.insert(key.to_string(), value.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Initializable for ScriptedService {
    async fn initialize(&self) -> CapabilityResult {
        self.call(Stage::Initialize)
    }
}

#[async_trait]
impl Testable for ScriptedService {
    async fn test(&self) -> CapabilityResult {
        self.call(Stage::Test)
    }
}

#[async_trait]
impl Pretestable for ScriptedService {
    async fn pretest(&self) -> CapabilityResult {
        self.call(Stage::Pretest)
    }
}

#[async_trait]
impl Startable for ScriptedService {
    async fn start(&self) -> CapabilityResult {
        self.call(Stage::Start)
    }
}

#[async_trait]
impl Verifiable for ScriptedService {
    async fn verify(&self) -> CapabilityResult {
        self.call(Stage::Verify)
    }
}

#[async_trait]
impl Stoppable for ScriptedService {
    async fn stop(&self) -> CapabilityResult {
        self.call(Stage::Stop)
    }
}

#[async_trait]
impl Finalizable for ScriptedService {
    async fn finalize(&self) -> CapabilityResult {
        self.call(Stage::Finalize)
    }
}

#[async_trait]
impl Validatable for ScriptedService {
    async fn validate(&self) -> CapabilityResult {
        self.call(Stage::Validate)
    }
}

#[async_trait]
impl Shutdownable for ScriptedService {
    async fn shutdown(&self) -> CapabilityResult {
        self.call(Stage::Shutdown)
    }
}

impl Service for ScriptedService {
    fn name(&self) -> &str {
        &self.name
    }

    fn service_type(&self) -> &'static ServiceType {
        self.service_type
    }

    fn as_configurable(&self) -> Option<&dyn Configurable> {
        self.has(Capability::Configure).then_some(self as &dyn Configurable)
    }

    fn as_initializable(&self) -> Option<&dyn Initializable> {
        self.has(Capability::Initialize).then_some(self as &dyn Initializable)
    }

    fn as_testable(&self) -> Option<&dyn Testable> {
        self.has(Capability::Test).then_some(self as &dyn Testable)
    }

    fn as_pretestable(&self) -> Option<&dyn Pretestable> {
        self.has(Capability::Pretest).then_some(self as &dyn Pretestable)
    }

    fn as_startable(&self) -> Option<&dyn Startable> {
        self.has(Capability::Start).then_some(self as &dyn Startable)
    }

    fn as_verifiable(&self) -> Option<&dyn Verifiable> {
        self.has(Capability::Verify).then_some(self as &dyn Verifiable)
    }

    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        self.has(Capability::Stop).then_some(self as &dyn Stoppable)
    }

    fn as_finalizable(&self) -> Option<&dyn Finalizable> {
        self.has(Capability::Finalize).then_some(self as &dyn Finalizable)
    }

    fn as_validatable(&self) -> Option<&dyn Validatable> {
        self.has(Capability::Validate).then_some(self as &dyn Validatable)
    }

    fn as_shutdownable(&self) -> Option<&dyn Shutdownable> {
        self.has(Capability::Shutdown).then_some(self as &dyn Shutdownable)
    }
}

/// The nine capabilities the runner dispatches on (everything but Configure).
pub const DISPATCH_CAPABILITIES: [Capability; 9] = [
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

/// Subset of [`DISPATCH_CAPABILITIES`] selected by the low nine bits of `mask`.
pub fn subset(mask: u16) -> Vec<Capability> {
    DISPATCH_CAPABILITIES
        .iter()
        .enumerate()
        .filter(|(bit, _)| mask & (1 << bit) != 0)
        .map(|(_, cap)| *cap)
        .collect()
}
