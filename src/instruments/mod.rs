//! Simulated rig instruments.
//!
//! Stand-ins for the vendor clients of a real rig. Each one exercises a
//! different capability shape so that a full session can run without
//! hardware:
//!
//! - [`StimulusAgent`] - plays a stimulus script for a configured duration
//! - [`SyncBox`] - records sync lines, the reference clock of a session
//! - [`VideoCamera`] / [`PhotoCamera`] - both derived from the `Camera` base type
//! - [`CoordinateLogger`] - logs 3-D probe coordinates, no start/stop at all
//! - [`EphysAcquisition`] - electrophysiology recording, every capability
//!
//! All mock devices use async-safe operations (`tokio::time`, `tokio::fs`).

pub mod camera;
pub mod coordinates;
pub mod ephys;
pub mod stimulus;
pub mod sync;

pub use camera::{PhotoCamera, VideoCamera, CAMERA, PHOTO_CAMERA, VIDEO_CAMERA};
pub use coordinates::{CoordinateLogger, COORDINATE_LOGGER};
pub use ephys::{EphysAcquisition, EPHYS_ACQUISITION};
pub use stimulus::{StimulusAgent, STIMULUS_AGENT};
pub use sync::{SyncBox, SYNC_BOX};

use crate::error::ServiceError;
use crate::service::SharedService;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// One instance of every simulated instrument, sharing an output directory.
pub struct SimulatedRig {
    pub stimulus: Arc<StimulusAgent>,
    pub sync: Arc<SyncBox>,
    pub video: Arc<VideoCamera>,
    pub photo: Arc<PhotoCamera>,
    pub coordinates: Arc<CoordinateLogger>,
    pub ephys: Arc<EphysAcquisition>,
}

impl SimulatedRig {
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        let dir = output_dir.as_ref();
        Self {
            stimulus: Arc::new(StimulusAgent::new("stimulus")),
            sync: Arc::new(SyncBox::new("sync", dir)),
            video: Arc::new(VideoCamera::new("video", dir)),
            photo: Arc::new(PhotoCamera::new("photo", dir)),
            coordinates: Arc::new(CoordinateLogger::new("coordinates", dir)),
            ephys: Arc::new(EphysAcquisition::new("ephys", dir)),
        }
    }

    /// Session order: the sync box first so it clocks everything after it,
    /// the stimulus agent last.
    pub fn services(&self) -> Vec<SharedService> {
        vec![
            self.sync.clone(),
            self.ephys.clone(),
            self.video.clone(),
            self.photo.clone(),
            self.coordinates.clone(),
            self.stimulus.clone(),
        ]
    }
}

/// Files written by one simulated device, oldest first.
#[derive(Debug)]
pub(crate) struct Recording {
    dir: PathBuf,
    prefix: String,
    extension: &'static str,
    files: Mutex<Vec<PathBuf>>,
}

impl Recording {
    pub(crate) fn new(dir: &Path, prefix: &str, extension: &'static str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            extension,
            files: Mutex::new(Vec::new()),
        }
    }

    /// Writes the next numbered file and records it.
    pub(crate) async fn write(&self, contents: String) -> Result<PathBuf, ServiceError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let index = self.files().len() + 1;
        let path = self
            .dir
            .join(format!("{}_{:03}.{}", self.prefix, index, self.extension));
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.clone());
        Ok(path)
    }

    pub(crate) fn files(&self) -> Vec<PathBuf> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fails unless the latest file exists and is not empty.
    pub(crate) async fn check_latest(&self) -> Result<(), ServiceError> {
        let Some(latest) = self.files().pop() else {
            return Err(anyhow::anyhow!("no {} file recorded", self.extension).into());
        };
        let metadata = tokio::fs::metadata(&latest)
            .await
            .with_context(|| format!("reading {}", latest.display()))?;
        if metadata.len() == 0 {
            return Err(anyhow::anyhow!("{} is empty", latest.display()).into());
        }
        Ok(())
    }
}

/// Error for a capability called on a device that was never initialized.
pub(crate) fn not_connected(service: &str) -> ServiceError {
    anyhow::anyhow!("{} is not connected", service).into()
}
