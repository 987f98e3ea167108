//! Background running-state watcher.
//!
//! Some services keep working after `start` returns (a stimulus agent playing a
//! script, for instance). The session driver waits for them at a barrier
//! while a spawned task polls the service on a fixed interval. The watcher only
//! reads; it never touches the service list or configuration.

use crate::error::{RigError, RigResult, ServiceError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Reports whether a service is still busy.
#[async_trait]
pub trait RunningProbe: Send + Sync {
    async fn is_running(&self) -> Result<bool, ServiceError>;
}

/// Spawns a task that resolves once `probe` reports not-running.
///
/// The first poll happens immediately. A probe error ends the watch. A zero
/// `poll_interval` is raised to one millisecond.
pub fn spawn_idle_watch(
    service: impl Into<String>,
    probe: Arc<dyn RunningProbe>,
    poll_interval: Duration,
) -> JoinHandle<RigResult<u32>> {
    let service = service.into();
    tokio::spawn(async move {
        let mut ticker = interval(poll_interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut polls = 0u32;
        loop {
            ticker.tick().await;
            polls += 1;
            match probe.is_running().await {
                Ok(true) => debug!(service = %service, polls, "Still running"),
                Ok(false) => {
                    info!(service = %service, polls, "Reported idle");
                    return Ok(polls);
                }
                Err(source) => return Err(RigError::Watch { service, source }),
            }
        }
    })
}

/// Waits until `probe` reports not-running, polling every `poll_interval`.
///
/// Returns the number of polls made. With a `timeout`, the watch is cancelled
/// and [`RigError::Timeout`] returned once it elapses.
pub async fn wait_until_idle(
    service: &str,
    probe: Arc<dyn RunningProbe>,
    poll_interval: Duration,
    timeout: Option<Duration>,
) -> RigResult<u32> {
    let mut handle = spawn_idle_watch(service, probe, poll_interval);
    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return Err(RigError::Timeout(limit));
            }
        },
        None => handle.await,
    };
    joined.map_err(|e| RigError::Watch {
        service: service.to_string(),
        source: ServiceError::Infrastructure(anyhow::anyhow!("watch task failed: {}", e)),
    })?
}
