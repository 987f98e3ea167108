//! Experiment session sequencing.
//!
//! An [`ExperimentSession`] binds an ordered service list, named groups and a
//! resolved configuration to one data-collection run, and is the only surface
//! a workflow driver (UI, CLI) calls:
//!
//! ```text
//! Unconfigured --configure--> Configured --initialize_and_test--> Ready
//!     Configured/Ready/Stopped --configure--> (unchanged)
//!     Ready/Stopped --pretest--> (unchanged)
//!     Ready/Started/Stopped --start(group)--> Started
//!     Started --stop(group)--> Stopped (once no group is left open)
//!     Stopped --validate--> Stopped
//!     any --shutdown--> Shutdown
//! ```
//!
//! A failing operation leaves the stage pointer where it was, so the caller
//! can fix the instrument and call the same operation again.

use crate::config::{ConfigMap, RigConfig};
use crate::error::{RigError, RigResult};
use crate::runner::{
    CleanupReport, ConfigureReport, InterventionHook, LifecycleRunner, RetryPolicy,
};
use crate::service::SharedService;
use crate::status::ComponentStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Group holding every service of the session, in session order.
pub const ALL: &str = "all";
/// Conventional name of the recording-device group.
pub const RECORDERS: &str = "recorders";
/// Conventional name of the stimulus group.
pub const STIMULUS: &str = "stimulus";

/// Who and what a session is about. Passed in explicitly; nothing is global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: Uuid,
    /// Subject (mouse) identifier
    pub subject: String,
    pub operator: String,
    pub experiment_type: String,
    pub created_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(
        subject: impl Into<String>,
        operator: impl Into<String>,
        experiment_type: impl Into<String>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            subject: subject.into(),
            operator: operator.into(),
            experiment_type: experiment_type.into(),
            created_at: Utc::now(),
        }
    }

    /// Folder name for artifacts, e.g. `20260118T093000_M1234`.
    pub fn folder_name(&self) -> String {
        format!("{}_{}", self.created_at.format("%Y%m%dT%H%M%S"), self.subject)
    }
}

/// Position of the session in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStage {
    Unconfigured,
    Configured,
    /// Every service initialized and tested.
    Ready,
    /// At least one group started and not yet stopped.
    Started,
    Stopped,
    Shutdown,
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStage::Unconfigured => "unconfigured",
            SessionStage::Configured => "configured",
            SessionStage::Ready => "ready",
            SessionStage::Started => "started",
            SessionStage::Stopped => "stopped",
            SessionStage::Shutdown => "shut down",
        };
        f.write_str(s)
    }
}

/// Builder for [`ExperimentSession`].
pub struct SessionBuilder {
    context: SessionContext,
    services: Vec<SharedService>,
    groups: Vec<(String, Vec<String>)>,
    config: ConfigMap,
    runner: LifecycleRunner,
    status: ComponentStatus,
}

impl SessionBuilder {
    pub fn service(mut self, service: SharedService) -> Self {
        self.services.push(service);
        self
    }

    pub fn services(mut self, services: impl IntoIterator<Item = SharedService>) -> Self {
        self.services.extend(services);
        self
    }

    /// Declares a named, ordered subset of the session's services.
    pub fn group<I, S>(mut self, name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups
            .push((name.into(), members.into_iter().map(Into::into).collect()));
        self
    }

    pub fn config(mut self, config: ConfigMap) -> Self {
        self.config = config;
        self
    }

    pub fn runner(mut self, runner: LifecycleRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Installs the hook consulted between failed Initialize+Test attempts.
    pub fn hook(mut self, hook: Arc<dyn InterventionHook>) -> Self {
        self.runner = self.runner.with_hook(hook);
        self
    }

    /// Shares an existing status map (e.g. one a UI already watches).
    pub fn status(mut self, status: ComponentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn build(self) -> RigResult<ExperimentSession> {
        let mut groups = BTreeMap::new();
        groups.insert(ALL.to_string(), self.services.clone());

        for (name, members) in self.groups {
            if name == ALL {
                return Err(RigError::Configuration(format!(
                    "Group name '{}' is reserved",
                    ALL
                )));
            }
            let resolved = members
                .iter()
                .map(|member| {
                    self.services
                        .iter()
                        .find(|service| service.name() == member)
                        .cloned()
                        .ok_or_else(|| RigError::UnknownService(member.clone()))
                })
                .collect::<RigResult<Vec<_>>>()?;
            groups.insert(name, resolved);
        }

        info!(
            session = %self.context.session_id,
            subject = %self.context.subject,
            operator = %self.context.operator,
            services = self.services.len(),
            "Session created"
        );

        Ok(ExperimentSession {
            context: self.context,
            services: self.services,
            groups,
            config: self.config,
            runner: self.runner,
            status: self.status,
            stage: SessionStage::Unconfigured,
            open_groups: Vec::new(),
        })
    }
}

/// One data-collection run over a fixed, ordered set of services.
pub struct ExperimentSession {
    context: SessionContext,
    services: Vec<SharedService>,
    groups: BTreeMap<String, Vec<SharedService>>,
    config: ConfigMap,
    runner: LifecycleRunner,
    status: ComponentStatus,
    stage: SessionStage,
    open_groups: Vec<String>,
}

impl ExperimentSession {
    pub fn builder(context: SessionContext) -> SessionBuilder {
        SessionBuilder {
            context,
            services: Vec::new(),
            groups: Vec::new(),
            config: ConfigMap::new(),
            runner: LifecycleRunner::default(),
            status: ComponentStatus::new(),
        }
    }

    /// Builds a session from rig configuration: retry policy, recorder and
    /// stimulus groups, and per-service settings all come from `config`.
    pub fn from_config(
        context: SessionContext,
        services: Vec<SharedService>,
        config: &RigConfig,
    ) -> RigResult<Self> {
        Self::configured_builder(context, services, config).build()
    }

    /// Same as [`from_config`](Self::from_config), leaving the builder open
    /// for further changes (an intervention hook, extra groups).
    pub fn configured_builder(
        context: SessionContext,
        services: Vec<SharedService>,
        config: &RigConfig,
    ) -> SessionBuilder {
        let mut builder = Self::builder(context)
            .services(services)
            .config(config.service_settings())
            .runner(LifecycleRunner::new(RetryPolicy::from(&config.session)));
        if !config.session.recorders.is_empty() {
            builder = builder.group(RECORDERS, config.session.recorders.iter().cloned());
        }
        if !config.session.stimulus.is_empty() {
            builder = builder.group(STIMULUS, config.session.stimulus.iter().cloned());
        }
        builder
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn stage(&self) -> SessionStage {
        self.stage
    }

    pub fn status(&self) -> &ComponentStatus {
        &self.status
    }

    pub fn services(&self) -> &[SharedService] {
        &self.services
    }

    pub fn group(&self, name: &str) -> RigResult<&[SharedService]> {
        self.groups
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| RigError::UnknownGroup(name.to_string()))
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Groups started and not yet stopped, in start order.
    pub fn open_groups(&self) -> &[String] {
        &self.open_groups
    }

    /// Applies per-service settings. Never fails on a service's behalf.
    ///
    /// May run again before any later acquisition (from Ready or Stopped);
    /// the stage pointer only moves when leaving Unconfigured.
    pub async fn configure(&mut self) -> RigResult<ConfigureReport> {
        self.expect_stage(
            "configure",
            &[
                SessionStage::Unconfigured,
                SessionStage::Configured,
                SessionStage::Ready,
                SessionStage::Stopped,
            ],
        )?;
        let report = self.runner.configure(&self.services, &self.config).await;
        if self.stage == SessionStage::Unconfigured {
            self.advance(SessionStage::Configured);
        }
        Ok(report)
    }

    /// Replaces the per-service settings used by the next [`configure`](Self::configure).
    pub fn set_config(&mut self, config: ConfigMap) {
        self.config = config;
    }

    pub async fn initialize_and_test(&mut self) -> RigResult<()> {
        self.expect_stage(
            "initialize and test",
            &[SessionStage::Configured, SessionStage::Ready],
        )?;
        self.runner
            .initialize_and_test(&self.services, &self.status)
            .await?;
        self.advance(SessionStage::Ready);
        Ok(())
    }

    /// May be repeated any number of times before a start.
    pub async fn pretest(&mut self) -> RigResult<()> {
        self.expect_stage("pretest", &[SessionStage::Ready, SessionStage::Stopped])?;
        self.runner.pretest(&self.services).await
    }

    /// Starts and verifies a group. On failure the group is already rolled
    /// back and is not considered open.
    pub async fn start(&mut self, group: &str) -> RigResult<()> {
        self.expect_stage(
            "start",
            &[SessionStage::Ready, SessionStage::Started, SessionStage::Stopped],
        )?;
        if self.open_groups.iter().any(|open| open == group) {
            return Err(RigError::GroupAlreadyStarted(group.to_string()));
        }
        let members = self.group(group)?.to_vec();

        info!(session = %self.context.session_id, group, "Starting group");
        self.runner.start(&members).await?;
        self.open_groups.push(group.to_string());
        self.advance(SessionStage::Started);
        Ok(())
    }

    /// Stops then finalizes a started group. Per-service failures are logged
    /// and returned in the report rather than aborting the stop.
    pub async fn stop(&mut self, group: &str) -> RigResult<CleanupReport> {
        let position = self
            .open_groups
            .iter()
            .position(|open| open == group)
            .ok_or_else(|| RigError::GroupNotStarted(group.to_string()))?;
        let members = self.group(group)?.to_vec();

        info!(session = %self.context.session_id, group, "Stopping group");
        let report = self.runner.stop(&members).await;
        self.open_groups.remove(position);
        if self.open_groups.is_empty() {
            self.advance(SessionStage::Stopped);
        }
        Ok(report)
    }

    /// Stops every open group, most recently started first.
    pub async fn stop_all(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();
        while let Some(group) = self.open_groups.last().cloned() {
            match self.stop(&group).await {
                Ok(group_report) => report.merge(group_report),
                Err(e) => {
                    // Unreachable for groups taken from `open_groups`, but never loop forever.
                    warn!(group = %group, error = %e, "Could not stop group");
                    self.open_groups.retain(|open| *open != group);
                }
            }
        }
        report
    }

    /// Starts `group`, awaits `body`, then stops `group` whatever `body`
    /// returned. An error from `body` takes precedence over cleanup failures.
    pub async fn run_group<F, Fut, T>(&mut self, group: &str, body: F) -> RigResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RigResult<T>>,
    {
        self.start(group).await?;
        let outcome = body().await;
        let report = self.stop(group).await?;
        if !report.is_clean() {
            warn!(group, failures = report.failures.len(), "Group stopped with failures");
        }
        outcome
    }

    pub async fn validate(&mut self) -> RigResult<CleanupReport> {
        self.expect_stage("validate", &[SessionStage::Stopped])?;
        Ok(self.runner.validate(&self.services).await)
    }

    /// Stops any open group, then shuts every service down. Terminal.
    pub async fn shutdown(&mut self) -> RigResult<CleanupReport> {
        if self.stage == SessionStage::Shutdown {
            return Err(RigError::InvalidTransition {
                from: self.stage.to_string(),
                op: "shut down",
            });
        }
        let mut report = self.stop_all().await;
        report.merge(self.runner.shutdown(&self.services).await);
        self.advance(SessionStage::Shutdown);
        Ok(report)
    }

    fn expect_stage(&self, op: &'static str, allowed: &[SessionStage]) -> RigResult<()> {
        if allowed.contains(&self.stage) {
            Ok(())
        } else {
            Err(RigError::InvalidTransition {
                from: self.stage.to_string(),
                op,
            })
        }
    }

    fn advance(&mut self, next: SessionStage) {
        if self.stage != next {
            info!(
                session = %self.context.session_id,
                from = %self.stage,
                to = %next,
                "Session stage changed"
            );
            self.stage = next;
        }
    }
}
