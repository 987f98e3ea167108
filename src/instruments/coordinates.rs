//! Simulated 3-D coordinate logger.
//!
//! Logs the probe position of a session. It never starts or stops; the
//! coordinates are written on finalize and checked against the travel limits
//! on validate.

use crate::capabilities::{
    Capability, CapabilityResult, CapabilitySet, Configurable, Finalizable, Initializable,
    Testable, Validatable,
};
use crate::config::ServiceSettings;
use crate::data_files::DataProducer;
use crate::error::ServiceError;
use crate::instruments::Recording;
use crate::service::{Service, ServiceType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

pub static COORDINATE_LOGGER: ServiceType = ServiceType::root(
    "CoordinateLogger",
    CapabilitySet::from_capabilities(&[
        Capability::Configure,
        Capability::Initialize,
        Capability::Test,
        Capability::Finalize,
        Capability::Validate,
    ]),
);

/// Probe position in micrometres, relative to bregma.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinateConfig {
    pub x_um: f64,
    pub y_um: f64,
    pub z_um: f64,
    /// Largest distance from the origin the manipulator can reach
    pub max_travel_um: f64,
}

impl Default for CoordinateConfig {
    fn default() -> Self {
        Self {
            x_um: 0.0,
            y_um: 0.0,
            z_um: 0.0,
            max_travel_um: 10_000.0,
        }
    }
}

impl CoordinateConfig {
    fn distance_um(&self) -> f64 {
        (self.x_um.powi(2) + self.y_um.powi(2) + self.z_um.powi(2)).sqrt()
    }
}

pub struct CoordinateLogger {
    name: String,
    config: RwLock<CoordinateConfig>,
    open: RwLock<bool>,
    recording: Recording,
}

impl CoordinateLogger {
    pub fn new(name: impl Into<String>, output_dir: &Path) -> Self {
        let name = name.into();
        Self {
            recording: Recording::new(output_dir, &name, "json"),
            name,
            config: RwLock::new(CoordinateConfig::default()),
            open: RwLock::new(false),
        }
    }
}

#[async_trait]
impl Configurable for CoordinateLogger {
    async fn configure(&self, settings: &ServiceSettings) -> CapabilityResult {
        let mut config = self.config.write().await;
        *config = settings.overlay(&*config)?;
        Ok(())
    }
}

#[async_trait]
impl Initializable for CoordinateLogger {
    async fn initialize(&self) -> CapabilityResult {
        *self.open.write().await = true;
        Ok(())
    }
}

#[async_trait]
impl Testable for CoordinateLogger {
    async fn test(&self) -> CapabilityResult {
        if !*self.open.read().await {
            return Err(ServiceError::NotReady(format!("{} log is not open", self.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl Finalizable for CoordinateLogger {
    async fn finalize(&self) -> CapabilityResult {
        let config = self.config.read().await.clone();
        let contents = serde_json::to_string_pretty(&config).map_err(anyhow::Error::from)?;
        self.recording.write(contents).await?;
        Ok(())
    }
}

#[async_trait]
impl Validatable for CoordinateLogger {
    async fn validate(&self) -> CapabilityResult {
        self.recording.check_latest().await?;
        let config = self.config.read().await;
        let distance = config.distance_um();
        if distance > config.max_travel_um {
            return Err(anyhow::anyhow!(
                "probe at {:.0} um is beyond the {:.0} um travel limit",
                distance,
                config.max_travel_um
            )
            .into());
        }
        Ok(())
    }
}

impl DataProducer for CoordinateLogger {
    fn data_files(&self) -> Vec<PathBuf> {
        self.recording.files()
    }
}

impl Service for CoordinateLogger {
    fn name(&self) -> &str {
        &self.name
    }

    fn service_type(&self) -> &'static ServiceType {
        &COORDINATE_LOGGER
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

    fn as_finalizable(&self) -> Option<&dyn Finalizable> {
        Some(self)
    }

    fn as_validatable(&self) -> Option<&dyn Validatable> {
        Some(self)
    }

    fn as_data_producer(&self) -> Option<&dyn DataProducer> {
        Some(self)
    }
}
