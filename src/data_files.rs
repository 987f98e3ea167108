//! Data-files contract and artifact collection.
//!
//! Services that write files during a run expose them through
//! [`DataProducer`]. After a run, [`ArtifactCollector`] copies each producer's
//! most recent file into the session folder. The lifecycle runner never looks
//! at any of this.
//!
//! ```
//! use rig_orchestrator::data_files::ArtifactCollector;
//! use rig_orchestrator::instruments::SimulatedRig;
//!
//! # tokio_test::block_on(async {
//! let scratch = tempfile::tempdir().unwrap();
//! let out = tempfile::tempdir().unwrap();
//! let rig = SimulatedRig::new(scratch.path());
//! let collector = ArtifactCollector::new(out.path().join("session"));
//!
//! // Nothing recorded yet, so nothing to collect.
//! let collected = collector.collect(&rig.services()).await.unwrap();
//! assert!(collected.is_empty());
//! assert!(collector.destination().is_dir());
//! # });
//! ```

use crate::error::RigResult;
use crate::service::SharedService;
use crate::session::SessionContext;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A service that leaves artifacts on disk.
pub trait DataProducer: Send + Sync {
    /// Files produced so far, most recent last.
    fn data_files(&self) -> Vec<PathBuf>;

    /// Most recent file whose file name matches `pattern`.
    fn latest_data(&self, pattern: &Regex) -> Option<PathBuf> {
        self.data_files().into_iter().rev().find(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| pattern.is_match(name))
        })
    }
}

/// A file copied into the session folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedArtifact {
    pub service: String,
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// Copies artifacts of a session's services into one folder.
#[derive(Debug, Clone)]
pub struct ArtifactCollector {
    destination: PathBuf,
}

impl ArtifactCollector {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
        }
    }

    /// Collector targeting `<root>/<session folder name>`.
    pub fn for_session(root: impl AsRef<Path>, context: &SessionContext) -> Self {
        Self::new(root.as_ref().join(context.folder_name()))
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Copies the latest file of every producer. Services that produce
    /// nothing are skipped.
    pub async fn collect(&self, services: &[SharedService]) -> RigResult<Vec<CollectedArtifact>> {
        self.collect_with(services, |producer| producer.data_files().pop())
            .await
    }

    /// Copies the latest file matching `pattern` of every producer.
    pub async fn collect_matching(
        &self,
        services: &[SharedService],
        pattern: &Regex,
    ) -> RigResult<Vec<CollectedArtifact>> {
        self.collect_with(services, |producer| producer.latest_data(pattern))
            .await
    }

    async fn collect_with<F>(
        &self,
        services: &[SharedService],
        pick: F,
    ) -> RigResult<Vec<CollectedArtifact>>
    where
        F: Fn(&dyn DataProducer) -> Option<PathBuf>,
    {
        tokio::fs::create_dir_all(&self.destination).await?;

        let mut collected = Vec::new();
        for service in services {
            let Some(producer) = service.as_data_producer() else {
                continue;
            };
            let Some(source) = pick(producer) else {
                debug!(service = %service.name(), "No artifact to collect");
                continue;
            };
            let Some(file_name) = source.file_name() else {
                continue;
            };

            let destination = self.destination.join(format!(
                "{}_{}",
                service.name(),
                file_name.to_string_lossy()
            ));
            let bytes = tokio::fs::copy(&source, &destination).await?;
            info!(
                service = %service.name(),
                source = %source.display(),
                destination = %destination.display(),
                bytes,
                "Collected artifact"
            );
            collected.push(CollectedArtifact {
                service: service.name().to_string(),
                source,
                destination,
            });
        }
        Ok(collected)
    }
}
