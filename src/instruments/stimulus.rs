//! Simulated stimulus-presentation agent.
//!
//! The agent plays a script for `duration_ms` after `start` returns. It is the
//! one service the session waits on, through its [`RunningProbe`] impl.

use crate::capabilities::{
    Capability, CapabilityResult, CapabilitySet, Configurable, Initializable, Pretestable,
    Shutdownable, Startable, Stoppable, Testable,
};
use crate::config::ServiceSettings;
use crate::error::ServiceError;
use crate::instruments::not_connected;
use crate::service::{Service, ServiceType};
use crate::watcher::RunningProbe;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

pub static STIMULUS_AGENT: ServiceType = ServiceType::root(
    "StimulusAgent",
    CapabilitySet::from_capabilities(&[
        Capability::Configure,
        Capability::Initialize,
        Capability::Test,
        Capability::Pretest,
        Capability::Start,
        Capability::Stop,
        Capability::Shutdown,
    ]),
);

/// Settings accepted by [`StimulusAgent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StimulusConfig {
    /// Script the agent plays on start
    pub script: String,
    /// How long the script runs
    pub duration_ms: u64,
    /// Agent address (informational only)
    pub host: String,
}

impl Default for StimulusConfig {
    fn default() -> Self {
        Self {
            script: "gratings".to_string(),
            duration_ms: 1_000,
            host: "localhost:5000".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct AgentState {
    connected: bool,
    playing_since: Option<Instant>,
    plays: u32,
}

pub struct StimulusAgent {
    name: String,
    config: RwLock<StimulusConfig>,
    state: RwLock<AgentState>,
}

impl StimulusAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: RwLock::new(StimulusConfig::default()),
            state: RwLock::new(AgentState::default()),
        }
    }

    pub async fn config(&self) -> StimulusConfig {
        self.config.read().await.clone()
    }

    /// Number of scripts started since construction.
    pub async fn plays(&self) -> u32 {
        self.state.read().await.plays
    }
}

#[async_trait]
impl Configurable for StimulusAgent {
    async fn configure(&self, settings: &ServiceSettings) -> CapabilityResult {
        let mut config = self.config.write().await;
        *config = settings.overlay(&*config)?;
        debug!(service = %self.name, script = %config.script, "Stimulus configured");
        Ok(())
    }
}

#[async_trait]
impl Initializable for StimulusAgent {
    async fn initialize(&self) -> CapabilityResult {
        let host = self.config.read().await.host.clone();
        self.state.write().await.connected = true;
        info!(service = %self.name, host = %host, "Connected to stimulus agent");
        Ok(())
    }
}

#[async_trait]
impl Testable for StimulusAgent {
    async fn test(&self) -> CapabilityResult {
        if !self.state.read().await.connected {
            return Err(ServiceError::NotReady(format!(
                "{} did not answer the ping",
                self.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Pretestable for StimulusAgent {
    async fn pretest(&self) -> CapabilityResult {
        let state = self.state.read().await;
        if state.playing_since.is_some() {
            return Err(anyhow::anyhow!("{} is still playing", self.name).into());
        }
        if !state.connected {
            return Err(not_connected(&self.name));
        }
        Ok(())
    }
}

#[async_trait]
impl Startable for StimulusAgent {
    async fn start(&self) -> CapabilityResult {
        let script = self.config.read().await.script.clone();
        let mut state = self.state.write().await;
        if !state.connected {
            return Err(not_connected(&self.name));
        }
        state.playing_since = Some(Instant::now());
        state.plays += 1;
        info!(service = %self.name, script = %script, "Stimulus started");
        Ok(())
    }
}

#[async_trait]
impl Stoppable for StimulusAgent {
    async fn stop(&self) -> CapabilityResult {
        if let Some(since) = self.state.write().await.playing_since.take() {
            info!(
                service = %self.name,
                elapsed_ms = since.elapsed().as_millis() as u64,
                "Stimulus stopped"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Shutdownable for StimulusAgent {
    async fn shutdown(&self) -> CapabilityResult {
        let mut state = self.state.write().await;
        state.playing_since = None;
        state.connected = false;
        Ok(())
    }
}

#[async_trait]
impl RunningProbe for StimulusAgent {
    async fn is_running(&self) -> Result<bool, ServiceError> {
        let duration = Duration::from_millis(self.config.read().await.duration_ms);
        let state = self.state.read().await;
        Ok(state
            .playing_since
            .is_some_and(|since| since.elapsed() < duration))
    }
}

impl Service for StimulusAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn service_type(&self) -> &'static ServiceType {
        &STIMULUS_AGENT
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

    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        Some(self)
    }

    fn as_shutdownable(&self) -> Option<&dyn Shutdownable> {
        Some(self)
    }
}
