//! Capability-dispatch runner.
//!
//! Given an ordered slice of services and a stage, the runner calls the stage's
//! capability on every service that supports it, in slice order, awaiting each
//! call before moving on. Services without the capability are skipped.
//!
//! Failure policy per stage:
//!
//! | Stage                      | On failure                                          |
//! |----------------------------|-----------------------------------------------------|
//! | Configure                  | logged, recorded in [`ConfigureReport`], never fatal |
//! | Initialize + Test          | retried per [`RetryPolicy`], then escalated          |
//! | Pretest                    | propagated immediately                              |
//! | Start / Verify             | started services rolled back, then propagated       |
//! | Stop / Finalize            | logged, collected, remaining services still called  |
//! | Validate / Shutdown        | logged, collected, remaining services still called  |
//!
//! Start→Verify and Stop→Finalize are barriers: the first stage runs over the
//! whole group before the second begins.

use crate::capabilities::{Capability, Stage};
use crate::config::{ConfigMap, SessionSettings};
use crate::error::{RigError, RigResult, ServiceError, StageFailure};
use crate::service::SharedService;
use crate::status::ComponentStatus;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Defines a policy for retrying Initialize+Test.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Attempts per service, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl From<&SessionSettings> for RetryPolicy {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            backoff_delay: settings.retry_delay(),
        }
    }
}

/// What to do after a failed Initialize+Test attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intervention {
    Retry,
    Abort,
}

/// Context handed to an [`InterventionHook`] between attempts.
#[derive(Debug)]
pub struct AttemptFailure<'a> {
    pub service: &'a str,
    pub stage: Stage,
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
    pub max_attempts: u32,
    pub error: &'a ServiceError,
}

/// Called between failed attempts, e.g. to ask an operator to reseat a cable.
#[async_trait]
pub trait InterventionHook: Send + Sync {
    async fn intervene(&self, failure: &AttemptFailure<'_>) -> Intervention;
}

/// Default hook: always retry and let the attempt bound decide.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractive;

#[async_trait]
impl InterventionHook for NonInteractive {
    async fn intervene(&self, _failure: &AttemptFailure<'_>) -> Intervention {
        Intervention::Retry
    }
}

/// Outcome of the Configure pre-step.
#[derive(Debug, Default)]
pub struct ConfigureReport {
    /// Services whose settings were accepted.
    pub applied: Vec<String>,
    /// Services with no matching settings; left untouched.
    pub skipped: Vec<String>,
    /// Services with settings but no `Configurable` capability.
    pub ignored: Vec<String>,
    /// Services that refused their settings.
    pub rejected: Vec<(String, ServiceError)>,
}

impl ConfigureReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Failures suppressed during a best-effort stage.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub failures: Vec<StageFailure>,
    /// Number of capability calls made.
    pub calls: usize,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: CleanupReport) {
        self.failures.extend(other.failures);
        self.calls += other.calls;
    }

    /// Turns suppressed failures into an error for callers who want strictness.
    pub fn into_result(self) -> RigResult<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(RigError::CleanupFailed(self.failures))
        }
    }
}

/// Sequences capability calls over ordered service lists.
#[derive(Clone)]
pub struct LifecycleRunner {
    policy: RetryPolicy,
    hook: Arc<dyn InterventionHook>,
}

impl Default for LifecycleRunner {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl LifecycleRunner {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            hook: Arc::new(NonInteractive),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn InterventionHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Applies resolved settings to every configurable service.
    pub async fn configure(&self, services: &[SharedService], config: &ConfigMap) -> ConfigureReport {
        let mut report = ConfigureReport::default();

        for service in services {
            let name = service.name().to_string();
            let Some(settings) = config.resolve(service.as_ref()) else {
                debug!(service = %name, "No settings, skipping configure");
                report.skipped.push(name);
                continue;
            };

            let Some(configurable) = service.as_configurable() else {
                warn!(
                    service = %name,
                    keys = ?settings.keys().collect::<Vec<_>>(),
                    "Settings present for a service that is not configurable"
                );
                report.ignored.push(name);
                continue;
            };

            match configurable.configure(&settings).await {
                Ok(()) => {
                    info!(service = %name, attributes = settings.len(), "Configured");
                    report.applied.push(name);
                }
                Err(e) => {
                    error!(service = %name, error = %e, "Configure rejected settings");
                    report.rejected.push((name, e));
                }
            }
        }

        report
    }

    /// Initializes then tests each service before moving to the next one.
    ///
    /// A service is marked ready in `status` only after both steps succeeded.
    pub async fn initialize_and_test(
        &self,
        services: &[SharedService],
        status: &ComponentStatus,
    ) -> RigResult<()> {
        for service in services {
            self.initialize_and_test_one(service, status)
                .instrument(info_span!("initialize_and_test", service = %service.name()))
                .await?;
        }
        Ok(())
    }

    async fn initialize_and_test_one(
        &self,
        service: &SharedService,
        status: &ComponentStatus,
    ) -> RigResult<()> {
        let name = service.name();
        status.set_ready(name, false);

        let max_attempts = self.policy.max_attempts.max(1);
        let mut initialized = !service.supports(Capability::Initialize);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match self.initialize_once(service, &mut initialized).await {
                Ok(()) => match Stage::Test.invoke(service.as_ref()).await {
                    Some(Err(e)) => Err((Stage::Test, e)),
                    _ => Ok(()),
                },
                Err(e) => Err((Stage::Initialize, e)),
            };

            let (stage, error) = match outcome {
                Ok(()) => {
                    status.set_ready(name, true);
                    info!(service = %name, attempts = attempt, "Initialized and tested");
                    return Ok(());
                }
                Err(failure) => failure,
            };

            if error.is_not_ready() {
                warn!(service = %name, stage = %stage, attempt, error = %error, "Readiness check failed");
            } else {
                error!(service = %name, stage = %stage, attempt, error = %error, "Infrastructure error");
            }

            if attempt >= max_attempts {
                return Err(RigError::RetriesExhausted {
                    service: name.to_string(),
                    stage,
                    attempts: attempt,
                    source: error,
                });
            }

            let failure = AttemptFailure {
                service: name,
                stage,
                attempt,
                max_attempts,
                error: &error,
            };
            if self.hook.intervene(&failure).await == Intervention::Abort {
                return Err(RigError::Aborted {
                    service: name.to_string(),
                    stage,
                    attempts: attempt,
                    source: error,
                });
            }

            sleep(self.policy.backoff_delay).await;
        }
    }

    async fn initialize_once(
        &self,
        service: &SharedService,
        initialized: &mut bool,
    ) -> Result<(), ServiceError> {
        if *initialized {
            return Ok(());
        }
        if let Some(Err(e)) = Stage::Initialize.invoke(service.as_ref()).await {
            return Err(e);
        }
        *initialized = true;
        Ok(())
    }

    /// Runs Pretest; the first failure propagates.
    pub async fn pretest(&self, services: &[SharedService]) -> RigResult<()> {
        self.pretest_pass(services)
            .instrument(info_span!("stage", stage = %Stage::Pretest))
            .await
    }

    async fn pretest_pass(&self, services: &[SharedService]) -> RigResult<()> {
        for service in services {
            if let Some(Err(e)) = Stage::Pretest.invoke(service.as_ref()).await {
                error!(service = %service.name(), stage = %Stage::Pretest, error = %e, "Pretest failed");
                return Err(RigError::Stage {
                    service: service.name().to_string(),
                    stage: Stage::Pretest,
                    source: e,
                });
            }
        }
        Ok(())
    }

    /// Starts every member of `group`, then verifies every member.
    ///
    /// If a start fails, the members already started are stopped and finalized
    /// before the error is returned. If a verify fails, the whole group is
    /// stopped and finalized.
    pub async fn start(&self, group: &[SharedService]) -> RigResult<()> {
        self.start_pass(group)
            .instrument(info_span!("stage", stage = %Stage::Start))
            .await
    }

    async fn start_pass(&self, group: &[SharedService]) -> RigResult<()> {
        let mut started: Vec<SharedService> = Vec::new();

        for service in group {
            match Stage::Start.invoke(service.as_ref()).await {
                None => {}
                Some(Ok(())) => {
                    debug!(service = %service.name(), "Started");
                    started.push(service.clone());
                }
                Some(Err(e)) => {
                    error!(
                        service = %service.name(),
                        stage = %Stage::Start,
                        error = %e,
                        already_started = started.len(),
                        "Start failed, rolling back"
                    );
                    started.reverse();
                    self.log_cleanup(self.stop(&started).await);
                    return Err(RigError::Stage {
                        service: service.name().to_string(),
                        stage: Stage::Start,
                        source: e,
                    });
                }
            }
        }

        for service in group {
            if let Some(Err(e)) = Stage::Verify.invoke(service.as_ref()).await {
                error!(
                    service = %service.name(),
                    stage = %Stage::Verify,
                    error = %e,
                    "Verify failed, rolling back"
                );
                self.log_cleanup(self.stop(group).await);
                return Err(RigError::Stage {
                    service: service.name().to_string(),
                    stage: Stage::Verify,
                    source: e,
                });
            }
        }

        info!(services = group.len(), started = started.len(), "Group started and verified");
        Ok(())
    }

    /// Stops every member of `group`, then finalizes every member.
    pub async fn stop(&self, group: &[SharedService]) -> CleanupReport {
        let mut report = self.best_effort(group, Stage::Stop).await;
        report.merge(self.best_effort(group, Stage::Finalize).await);
        report
    }

    pub async fn validate(&self, services: &[SharedService]) -> CleanupReport {
        self.best_effort(services, Stage::Validate).await
    }

    pub async fn shutdown(&self, services: &[SharedService]) -> CleanupReport {
        self.best_effort(services, Stage::Shutdown).await
    }

    async fn best_effort(&self, services: &[SharedService], stage: Stage) -> CleanupReport {
        self.best_effort_pass(services, stage)
            .instrument(info_span!("stage", stage = %stage))
            .await
    }

    async fn best_effort_pass(&self, services: &[SharedService], stage: Stage) -> CleanupReport {
        let mut report = CleanupReport::default();
        for service in services {
            match stage.invoke(service.as_ref()).await {
                None => {}
                Some(Ok(())) => report.calls += 1,
                Some(Err(e)) => {
                    report.calls += 1;
                    error!(service = %service.name(), stage = %stage, error = %e, "Suppressed failure");
                    report.failures.push(StageFailure {
                        service: service.name().to_string(),
                        stage,
                        error: e,
                    });
                }
            }
        }
        report
    }

    fn log_cleanup(&self, report: CleanupReport) {
        if !report.is_clean() {
            warn!(failures = report.failures.len(), "Rollback completed with failures");
        }
    }
}
