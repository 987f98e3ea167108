//! Simulated electrophysiology acquisition.

use crate::capabilities::{
    Capability, CapabilityResult, CapabilitySet, Configurable, Finalizable, Initializable,
    Pretestable, Shutdownable, Startable, Stoppable, Testable, Validatable, Verifiable,
};
use crate::config::ServiceSettings;
use crate::data_files::DataProducer;
use crate::error::ServiceError;
use crate::instruments::{not_connected, Recording};
use crate::service::{Service, ServiceType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::info;

pub static EPHYS_ACQUISITION: ServiceType = ServiceType::root(
    "EphysAcquisition",
    CapabilitySet::from_capabilities(&[
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
    ]),
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EphysConfig {
    pub probe: String,
    pub channels: u32,
    pub sample_rate_hz: u32,
    /// Channels allowed to fail the impedance pretest
    pub max_bad_channels: u32,
}

impl Default for EphysConfig {
    fn default() -> Self {
        Self {
            probe: "probeA".to_string(),
            channels: 384,
            sample_rate_hz: 30_000,
            max_bad_channels: 8,
        }
    }
}

#[derive(Debug, Default)]
struct EphysState {
    connected: bool,
    /// Channels marked bad by the last impedance check
    bad_channels: u32,
    acquiring_since: Option<Instant>,
    pending_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EphysHeader {
    probe: String,
    channels: u32,
    sample_rate_hz: u32,
    duration_ms: u64,
}

pub struct EphysAcquisition {
    name: String,
    config: RwLock<EphysConfig>,
    state: RwLock<EphysState>,
    recording: Recording,
}

impl EphysAcquisition {
    pub fn new(name: impl Into<String>, output_dir: &Path) -> Self {
        let name = name.into();
        Self {
            recording: Recording::new(output_dir, &name, "dat"),
            name,
            config: RwLock::new(EphysConfig::default()),
            state: RwLock::new(EphysState::default()),
        }
    }

    /// Simulates channels failing the impedance check.
    pub async fn mark_bad_channels(&self, count: u32) {
        self.state.write().await.bad_channels = count;
    }
}

#[async_trait]
impl Configurable for EphysAcquisition {
    async fn configure(&self, settings: &ServiceSettings) -> CapabilityResult {
        let mut config = self.config.write().await;
        *config = settings.overlay(&*config)?;
        Ok(())
    }
}

#[async_trait]
impl Initializable for EphysAcquisition {
    async fn initialize(&self) -> CapabilityResult {
        let probe = self.config.read().await.probe.clone();
        self.state.write().await.connected = true;
        info!(service = %self.name, probe = %probe, "Acquisition system connected");
        Ok(())
    }
}

#[async_trait]
impl Testable for EphysAcquisition {
    async fn test(&self) -> CapabilityResult {
        if !self.state.read().await.connected {
            return Err(ServiceError::NotReady(format!("{} is offline", self.name)));
        }
        if self.config.read().await.channels == 0 {
            return Err(ServiceError::NotReady(format!("{} has no channels enabled", self.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl Pretestable for EphysAcquisition {
    async fn pretest(&self) -> CapabilityResult {
        let max_bad = self.config.read().await.max_bad_channels;
        let state = self.state.read().await;
        if !state.connected {
            return Err(not_connected(&self.name));
        }
        if state.bad_channels > max_bad {
            return Err(anyhow::anyhow!(
                "{} channels failed the impedance check (limit {})",
                state.bad_channels,
                max_bad
            )
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl Startable for EphysAcquisition {
    async fn start(&self) -> CapabilityResult {
        let mut state = self.state.write().await;
        if !state.connected {
            return Err(not_connected(&self.name));
        }
        state.acquiring_since = Some(Instant::now());
        state.pending_ms = None;
        Ok(())
    }
}

#[async_trait]
impl Verifiable for EphysAcquisition {
    async fn verify(&self) -> CapabilityResult {
        if self.state.read().await.acquiring_since.is_none() {
            return Err(anyhow::anyhow!("{} is not acquiring", self.name).into());
        }
        Ok(())
    }
}

#[async_trait]
impl Stoppable for EphysAcquisition {
    async fn stop(&self) -> CapabilityResult {
        let mut state = self.state.write().await;
        if let Some(since) = state.acquiring_since.take() {
            state.pending_ms = Some(since.elapsed().as_millis() as u64);
        }
        Ok(())
    }
}

#[async_trait]
impl Finalizable for EphysAcquisition {
    async fn finalize(&self) -> CapabilityResult {
        let Some(duration_ms) = self.state.write().await.pending_ms.take() else {
            return Ok(());
        };
        let config = self.config.read().await.clone();
        let header = EphysHeader {
            probe: config.probe,
            channels: config.channels,
            sample_rate_hz: config.sample_rate_hz,
            duration_ms,
        };
        let contents = serde_json::to_string(&header).map_err(anyhow::Error::from)?;
        self.recording.write(contents).await?;
        Ok(())
    }
}

#[async_trait]
impl Validatable for EphysAcquisition {
    async fn validate(&self) -> CapabilityResult {
        self.recording.check_latest().await
    }
}

#[async_trait]
impl Shutdownable for EphysAcquisition {
    async fn shutdown(&self) -> CapabilityResult {
        let mut state = self.state.write().await;
        state.acquiring_since = None;
        state.connected = false;
        Ok(())
    }
}

impl DataProducer for EphysAcquisition {
    fn data_files(&self) -> Vec<PathBuf> {
        self.recording.files()
    }
}

impl Service for EphysAcquisition {
    fn name(&self) -> &str {
        &self.name
    }

    fn service_type(&self) -> &'static ServiceType {
        &EPHYS_ACQUISITION
    }

    fn as_configurable(&self) -> Option<&dyn Configurable> {
        Some(self)
    }

    fn as_initializable(&self) -> Option<&dyn Initializable> {
        Some(self)
    }

    fn as_testable(&self) -> Option<&dyn Testable> {
        Some(self)
    }

    fn as_pretestable(&self) -> Option<&dyn Pretestable> {
        Some(self)
    }

    fn as_startable(&self) -> Option<&dyn Startable> {
        Some(self)
    }

    fn as_verifiable(&self) -> Option<&dyn Verifiable> {
        Some(self)
    }

    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        Some(self)
    }

    fn as_finalizable(&self) -> Option<&dyn Finalizable> {
        Some(self)
    }

    fn as_validatable(&self) -> Option<&dyn Validatable> {
        Some(self)
    }

    fn as_shutdownable(&self) -> Option<&dyn Shutdownable> {
        Some(self)
    }

    fn as_data_producer(&self) -> Option<&dyn DataProducer> {
        Some(self)
    }
}
