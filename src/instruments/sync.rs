//! Simulated sync box.
//!
//! Records digital sync lines between `start` and `stop`; `finalize` writes one
//! `.sync` file per run and `validate` checks it.

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
use tracing::{info, warn};

pub static SYNC_BOX: ServiceType = ServiceType::root(
    "SyncBox",
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
pub struct SyncConfig {
    pub sample_rate_hz: u32,
    /// Named digital input lines
    pub lines: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 100_000,
            lines: vec!["vsync".to_string(), "photodiode".to_string()],
        }
    }
}

#[derive(Debug, Default)]
struct SyncState {
    connected: bool,
    acquiring_since: Option<Instant>,
    /// Length of the last acquisition, waiting to be written by `finalize`.
    pending_ms: Option<u64>,
}

/// Summary written to each `.sync` file.
#[derive(Debug, Serialize, Deserialize)]
struct SyncSummary {
    lines: Vec<String>,
    sample_rate_hz: u32,
    duration_ms: u64,
    samples: u64,
}

pub struct SyncBox {
    name: String,
    config: RwLock<SyncConfig>,
    state: RwLock<SyncState>,
    recording: Recording,
}

impl SyncBox {
    pub fn new(name: impl Into<String>, output_dir: &Path) -> Self {
        let name = name.into();
        Self {
            recording: Recording::new(output_dir, &name, "sync"),
            name,
            config: RwLock::new(SyncConfig::default()),
            state: RwLock::new(SyncState::default()),
        }
    }

    pub async fn is_acquiring(&self) -> bool {
        self.state.read().await.acquiring_since.is_some()
    }
}

#[async_trait]
impl Configurable for SyncBox {
    async fn configure(&self, settings: &ServiceSettings) -> CapabilityResult {
        let mut config = self.config.write().await;
        *config = settings.overlay(&*config)?;
        Ok(())
    }
}

#[async_trait]
impl Initializable for SyncBox {
    async fn initialize(&self) -> CapabilityResult {
        self.state.write().await.connected = true;
        info!(service = %self.name, "Sync box connected");
        Ok(())
    }
}

#[async_trait]
impl Testable for SyncBox {
    async fn test(&self) -> CapabilityResult {
        if !self.state.read().await.connected {
            return Err(ServiceError::NotReady(format!("{} is offline", self.name)));
        }
        if self.config.read().await.lines.is_empty() {
            return Err(ServiceError::NotReady(format!(
                "{} has no sync lines configured",
                self.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Pretestable for SyncBox {
    async fn pretest(&self) -> CapabilityResult {
        if !self.state.read().await.connected {
            return Err(not_connected(&self.name));
        }
        Ok(())
    }
}

#[async_trait]
impl Startable for SyncBox {
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
impl Verifiable for SyncBox {
    async fn verify(&self) -> CapabilityResult {
        if !self.is_acquiring().await {
            return Err(anyhow::anyhow!("{} is not acquiring", self.name).into());
        }
        Ok(())
    }
}

#[async_trait]
impl Stoppable for SyncBox {
    async fn stop(&self) -> CapabilityResult {
        let mut state = self.state.write().await;
        if let Some(since) = state.acquiring_since.take() {
            state.pending_ms = Some(since.elapsed().as_millis() as u64);
        }
        Ok(())
    }
}

#[async_trait]
impl Finalizable for SyncBox {
    async fn finalize(&self) -> CapabilityResult {
        let Some(duration_ms) = self.state.write().await.pending_ms.take() else {
            warn!(service = %self.name, "Nothing recorded, no sync file written");
            return Ok(());
        };
        let config = self.config.read().await.clone();
        let summary = SyncSummary {
            samples: u64::from(config.sample_rate_hz) * duration_ms / 1_000,
            lines: config.lines,
            sample_rate_hz: config.sample_rate_hz,
            duration_ms,
        };
        let contents = serde_json::to_string_pretty(&summary).map_err(anyhow::Error::from)?;
        let path = self.recording.write(contents).await?;
        info!(service = %self.name, path = %path.display(), "Sync file written");
        Ok(())
    }
}

#[async_trait]
impl Validatable for SyncBox {
    async fn validate(&self) -> CapabilityResult {
        self.recording.check_latest().await
    }
}

#[async_trait]
impl Shutdownable for SyncBox {
    async fn shutdown(&self) -> CapabilityResult {
        let mut state = self.state.write().await;
        state.acquiring_since = None;
        state.connected = false;
        Ok(())
    }
}

impl DataProducer for SyncBox {
    fn data_files(&self) -> Vec<PathBuf> {
        self.recording.files()
    }
}

impl Service for SyncBox {
    fn name(&self) -> &str {
        &self.name
    }

    fn service_type(&self) -> &'static ServiceType {
        &SYNC_BOX
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
