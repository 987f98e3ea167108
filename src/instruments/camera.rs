//! Simulated cameras.
//!
//! `VideoCamera` and `PhotoCamera` both derive from the `Camera` base type, so
//! a `[services.Camera]` table configures both before their own tables apply.
//! Only the video camera records between start and stop; the photo camera
//! takes its snapshots on start and has nothing to stop.

use crate::capabilities::{
    Capability, CapabilityResult, CapabilitySet, Configurable, Finalizable, Initializable,
    Shutdownable, Startable, Stoppable, Testable, Verifiable,
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
use tracing::{debug, info};

/// Base type of every camera. Never instantiated on its own.
pub static CAMERA: ServiceType = ServiceType::root("Camera", CapabilitySet::empty());

pub static VIDEO_CAMERA: ServiceType = ServiceType {
    name: "VideoCamera",
    bases: &[&CAMERA],
    capabilities: CapabilitySet::from_capabilities(&[
        Capability::Configure,
        Capability::Initialize,
        Capability::Test,
        Capability::Start,
        Capability::Verify,
        Capability::Stop,
        Capability::Finalize,
        Capability::Shutdown,
    ]),
};

pub static PHOTO_CAMERA: ServiceType = ServiceType {
    name: "PhotoCamera",
    bases: &[&CAMERA],
    capabilities: CapabilitySet::from_capabilities(&[
        Capability::Configure,
        Capability::Initialize,
        Capability::Test,
        Capability::Start,
        Capability::Shutdown,
    ]),
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VideoConfig {
    pub exposure_ms: f64,
    pub gain: f64,
    pub fps: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            exposure_ms: 10.0,
            gain: 1.0,
            fps: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhotoConfig {
    pub exposure_ms: f64,
    pub gain: f64,
    /// Snapshots taken per start
    pub shots: u32,
}

impl Default for PhotoConfig {
    fn default() -> Self {
        Self {
            exposure_ms: 10.0,
            gain: 1.0,
            shots: 1,
        }
    }
}

/// Metadata written in place of image data.
#[derive(Debug, Serialize, Deserialize)]
struct FrameHeader {
    camera: String,
    exposure_ms: f64,
    gain: f64,
    frames: u64,
}

#[derive(Debug, Default)]
struct VideoState {
    connected: bool,
    recording_since: Option<Instant>,
    pending_frames: Option<u64>,
}

pub struct VideoCamera {
    name: String,
    config: RwLock<VideoConfig>,
    state: RwLock<VideoState>,
    recording: Recording,
}

impl VideoCamera {
    pub fn new(name: impl Into<String>, output_dir: &Path) -> Self {
        let name = name.into();
        Self {
            recording: Recording::new(output_dir, &name, "avi"),
            name,
            config: RwLock::new(VideoConfig::default()),
            state: RwLock::new(VideoState::default()),
        }
    }

    pub async fn config(&self) -> VideoConfig {
        self.config.read().await.clone()
    }
}

#[async_trait]
impl Configurable for VideoCamera {
    async fn configure(&self, settings: &ServiceSettings) -> CapabilityResult {
        let mut config = self.config.write().await;
        *config = settings.overlay(&*config)?;
        debug!(service = %self.name, fps = config.fps, exposure_ms = config.exposure_ms, "Camera configured");
        Ok(())
    }
}

#[async_trait]
impl Initializable for VideoCamera {
    async fn initialize(&self) -> CapabilityResult {
        self.state.write().await.connected = true;
        Ok(())
    }
}

#[async_trait]
impl Testable for VideoCamera {
    async fn test(&self) -> CapabilityResult {
        if !self.state.read().await.connected {
            return Err(ServiceError::NotReady(format!("{} is not streaming", self.name)));
        }
        let config = self.config.read().await;
        let frame_period_ms = 1_000.0 / f64::from(config.fps.max(1));
        if config.exposure_ms > frame_period_ms {
            return Err(ServiceError::NotReady(format!(
                "exposure {} ms exceeds the {:.1} ms frame period",
                config.exposure_ms, frame_period_ms
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Startable for VideoCamera {
    async fn start(&self) -> CapabilityResult {
        let mut state = self.state.write().await;
        if !state.connected {
            return Err(not_connected(&self.name));
        }
        state.recording_since = Some(Instant::now());
        state.pending_frames = None;
        Ok(())
    }
}

#[async_trait]
impl Verifiable for VideoCamera {
    async fn verify(&self) -> CapabilityResult {
        if self.state.read().await.recording_since.is_none() {
            return Err(anyhow::anyhow!("{} is not recording", self.name).into());
        }
        Ok(())
    }
}

#[async_trait]
impl Stoppable for VideoCamera {
    async fn stop(&self) -> CapabilityResult {
        let fps = u64::from(self.config.read().await.fps);
        let mut state = self.state.write().await;
        if let Some(since) = state.recording_since.take() {
            state.pending_frames = Some(fps * since.elapsed().as_millis() as u64 / 1_000);
        }
        Ok(())
    }
}

#[async_trait]
impl Finalizable for VideoCamera {
    async fn finalize(&self) -> CapabilityResult {
        let Some(frames) = self.state.write().await.pending_frames.take() else {
            return Ok(());
        };
        let config = self.config.read().await.clone();
        let header = FrameHeader {
            camera: self.name.clone(),
            exposure_ms: config.exposure_ms,
            gain: config.gain,
            frames,
        };
        let contents = serde_json::to_string(&header).map_err(anyhow::Error::from)?;
        let path = self.recording.write(contents).await?;
        info!(service = %self.name, frames, path = %path.display(), "Video written");
        Ok(())
    }
}

#[async_trait]
impl Shutdownable for VideoCamera {
    async fn shutdown(&self) -> CapabilityResult {
        let mut state = self.state.write().await;
        state.recording_since = None;
        state.connected = false;
        Ok(())
    }
}

impl DataProducer for VideoCamera {
    fn data_files(&self) -> Vec<PathBuf> {
        self.recording.files()
    }
}

impl Service for VideoCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn service_type(&self) -> &'static ServiceType {
        &VIDEO_CAMERA
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

    fn as_shutdownable(&self) -> Option<&dyn Shutdownable> {
        Some(self)
    }

    fn as_data_producer(&self) -> Option<&dyn DataProducer> {
        Some(self)
    }
}

pub struct PhotoCamera {
    name: String,
    config: RwLock<PhotoConfig>,
    connected: RwLock<bool>,
    recording: Recording,
}

impl PhotoCamera {
    pub fn new(name: impl Into<String>, output_dir: &Path) -> Self {
        let name = name.into();
        Self {
            recording: Recording::new(output_dir, &name, "png"),
            name,
            config: RwLock::new(PhotoConfig::default()),
            connected: RwLock::new(false),
        }
    }

    pub async fn config(&self) -> PhotoConfig {
        self.config.read().await.clone()
    }
}

#[async_trait]
impl Configurable for PhotoCamera {
    async fn configure(&self, settings: &ServiceSettings) -> CapabilityResult {
        let mut config = self.config.write().await;
        *config = settings.overlay(&*config)?;
        Ok(())
    }
}

#[async_trait]
impl Initializable for PhotoCamera {
    async fn initialize(&self) -> CapabilityResult {
        *self.connected.write().await = true;
        Ok(())
    }
}

#[async_trait]
impl Testable for PhotoCamera {
    async fn test(&self) -> CapabilityResult {
        if !*self.connected.read().await {
            return Err(ServiceError::NotReady(format!("{} is not connected", self.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl Startable for PhotoCamera {
    async fn start(&self) -> CapabilityResult {
        if !*self.connected.read().await {
            return Err(not_connected(&self.name));
        }
        let config = self.config.read().await.clone();
        for _ in 0..config.shots {
            let header = FrameHeader {
                camera: self.name.clone(),
                exposure_ms: config.exposure_ms,
                gain: config.gain,
                frames: 1,
            };
            let contents = serde_json::to_string(&header).map_err(anyhow::Error::from)?;
            self.recording.write(contents).await?;
        }
        info!(service = %self.name, shots = config.shots, "Snapshots taken");
        Ok(())
    }
}

#[async_trait]
impl Shutdownable for PhotoCamera {
    async fn shutdown(&self) -> CapabilityResult {
        *self.connected.write().await = false;
        Ok(())
    }
}

impl DataProducer for PhotoCamera {
    fn data_files(&self) -> Vec<PathBuf> {
        self.recording.files()
    }
}

impl Service for PhotoCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn service_type(&self) -> &'static ServiceType {
        &PHOTO_CAMERA
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

    fn as_startable(&self) -> Option<&dyn Startable> {
        Some(self)
    }

    fn as_shutdownable(&self) -> Option<&dyn Shutdownable> {
        Some(self)
    }

    fn as_data_producer(&self) -> Option<&dyn DataProducer> {
        Some(self)
    }
}
