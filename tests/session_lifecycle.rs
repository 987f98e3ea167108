//! End-to-end lifecycle tests driven through `LifecycleRunner` and
//! `ExperimentSession` with scripted services.

mod common;

use async_trait::async_trait;
use common::{leak_type, CallLog, Fault, ScriptedService};
use rig_orchestrator::capabilities::{Capability, CapabilitySet, Stage};
use rig_orchestrator::config::{ConfigMap, ServiceSettings};
use rig_orchestrator::error::RigError;
use rig_orchestrator::runner::{
    AttemptFailure, Intervention, InterventionHook, LifecycleRunner, RetryPolicy,
};
use rig_orchestrator::service::SharedService;
use rig_orchestrator::session::{
    ExperimentSession, SessionContext, SessionStage, ALL, RECORDERS, STIMULUS,
};
use rig_orchestrator::status::ComponentStatus;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_test::traced_test;

use Capability::*;

fn context() -> SessionContext {
    SessionContext::new("M1234", "operator", "behavior")
}

fn quick_runner(max_attempts: u32) -> LifecycleRunner {
    LifecycleRunner::new(RetryPolicy {
        max_attempts,
        backoff_delay: Duration::ZERO,
    })
}

const FULL: &[Capability] = &[
    Initialize, Test, Pretest, Start, Verify, Stop, Finalize, Validate, Shutdown,
];

// =============================================================================
// Dispatch order and barriers
// =============================================================================

#[tokio::test]
async fn test_starts_precede_single_verify() {
    let log = CallLog::new();
    let a = ScriptedService::new("A", &[Start, Verify], &log);
    let b = ScriptedService::new("B", &[Start], &log);

    quick_runner(1)
        .start(&[a.shared(), b.shared()])
        .await
        .unwrap();

    assert_eq!(log.entries(), ["A.start", "B.start", "A.verify"]);
}

#[tokio::test]
async fn test_start_and_stop_are_barriers() {
    let log = CallLog::new();
    let group: Vec<SharedService> = ["A", "B", "C"]
        .iter()
        .map(|name| ScriptedService::new(name, &[Start, Verify, Stop, Finalize], &log).shared())
        .collect();
    let runner = quick_runner(1);

    runner.start(&group).await.unwrap();
    let report = runner.stop(&group).await;
    assert!(report.is_clean());

    let last_start = ["A", "B", "C"]
        .iter()
        .map(|n| log.position(&format!("{}.start", n)).unwrap())
        .max()
        .unwrap();
    let first_verify = ["A", "B", "C"]
        .iter()
        .map(|n| log.position(&format!("{}.verify", n)).unwrap())
        .min()
        .unwrap();
    assert!(last_start < first_verify);

    let last_stop = ["A", "B", "C"]
        .iter()
        .map(|n| log.position(&format!("{}.stop", n)).unwrap())
        .max()
        .unwrap();
    let first_finalize = ["A", "B", "C"]
        .iter()
        .map(|n| log.position(&format!("{}.finalize", n)).unwrap())
        .min()
        .unwrap();
    assert!(last_stop < first_finalize);
}

// =============================================================================
// Rollback
// =============================================================================

#[tokio::test]
#[traced_test]
async fn test_failed_start_stops_already_started() {
    let log = CallLog::new();
    let a = ScriptedService::new("A", &[Start, Stop], &log);
    let b = ScriptedService::new("B", &[Start, Stop], &log);
    b.fail_always(Stage::Start, Fault::Infrastructure);

    let err = quick_runner(1)
        .start(&[a.shared(), b.shared()])
        .await
        .unwrap_err();

    assert_eq!(log.entries(), ["A.start", "B.start", "A.stop"]);
    assert_eq!(log.count("A.stop"), 1);
    assert_eq!(err.service(), Some("B"));
    assert_eq!(err.stage(), Some(Stage::Start));
    assert!(err.to_string().contains("B failed during start"));
    assert!(logs_contain("Start failed, rolling back"));
    assert!(logs_contain("service=B"));
}

#[tokio::test]
async fn test_failed_session_start_leaves_group_closed() {
    let log = CallLog::new();
    let sync = ScriptedService::new("sync", &[Start, Stop], &log);
    let cam = ScriptedService::new("cam", &[Start, Stop], &log);
    cam.fail_always(Stage::Start, Fault::Infrastructure);
    let mut session = ExperimentSession::builder(context())
        .services([sync.shared(), cam.shared()])
        .group(RECORDERS, ["sync", "cam"])
        .build()
        .unwrap();
    session.configure().await.unwrap();
    session.initialize_and_test().await.unwrap();

    assert!(session.start(RECORDERS).await.is_err());

    assert!(session.open_groups().is_empty());
    assert_eq!(session.stage(), SessionStage::Ready);
    assert!(matches!(
        session.stop(RECORDERS).await,
        Err(RigError::GroupNotStarted(ref group)) if group == RECORDERS
    ));
    assert_eq!(session.stage(), SessionStage::Ready);
    assert_eq!(log.count("sync.stop"), 1);
}

#[tokio::test]
async fn test_failed_verify_stops_and_finalizes_whole_group() {
    let log = CallLog::new();
    let a = ScriptedService::new("A", &[Start, Verify, Stop, Finalize], &log);
    let b = ScriptedService::new("B", &[Start, Verify, Stop], &log);
    let c = ScriptedService::new("C", &[Start, Finalize], &log);
    b.fail_always(Stage::Verify, Fault::Infrastructure);

    let err = quick_runner(1)
        .start(&[a.shared(), b.shared(), c.shared()])
        .await
        .unwrap_err();

    assert!(matches!(err, RigError::Stage { stage: Stage::Verify, .. }));
    assert_eq!(log.count("A.stop"), 1);
    assert_eq!(log.count("B.stop"), 1);
    assert_eq!(log.count("A.finalize"), 1);
    assert_eq!(log.count("C.finalize"), 1);
}

#[tokio::test]
async fn test_session_run_group_stops_after_body_error() {
    let log = CallLog::new();
    let cam = ScriptedService::new("cam", &[Start, Stop, Finalize], &log);
    let mut session = ExperimentSession::builder(context())
        .service(cam.shared())
        .group(RECORDERS, ["cam"])
        .runner(quick_runner(1))
        .build()
        .unwrap();
    session.configure().await.unwrap();
    session.initialize_and_test().await.unwrap();

    let outcome: Result<(), RigError> = session
        .run_group(RECORDERS, || async {
            Err(RigError::Configuration("stimulus agent crashed".into()))
        })
        .await;

    assert!(outcome.is_err());
    assert_eq!(log.entries(), ["cam.start", "cam.stop", "cam.finalize"]);
    assert_eq!(session.stage(), SessionStage::Stopped);
}

// =============================================================================
// Best-effort cleanup
// =============================================================================

#[tokio::test]
#[traced_test]
async fn test_cleanup_failure_does_not_skip_remaining_services() {
    let log = CallLog::new();
    let a = ScriptedService::new("A", &[Stop, Finalize, Shutdown], &log);
    let b = ScriptedService::new("B", &[Stop, Finalize, Shutdown], &log);
    a.fail_always(Stage::Stop, Fault::Infrastructure);
    a.fail_always(Stage::Shutdown, Fault::Infrastructure);
    let group = [a.shared(), b.shared()];
    let runner = quick_runner(1);

    let report = runner.stop(&group).await;
    assert_eq!(log.entries(), ["A.stop", "B.stop", "A.finalize", "B.finalize"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].service, "A");
    assert_eq!(report.failures[0].stage, Stage::Stop);
    assert_eq!(report.calls, 4);

    let report = runner.shutdown(&group).await;
    assert_eq!(log.count("B.shutdown"), 1);
    assert!(matches!(report.into_result(), Err(RigError::CleanupFailed(f)) if f.len() == 1));
    assert!(logs_contain("Suppressed failure"));
}

// =============================================================================
// Initialize + Test retries
// =============================================================================

/// Records the readiness of the failing service each time it is consulted.
struct StatusProbe {
    status: ComponentStatus,
    seen: Mutex<Vec<Option<bool>>>,
    decision: Intervention,
}

#[async_trait]
impl InterventionHook for StatusProbe {
    async fn intervene(&self, failure: &AttemptFailure<'_>) -> Intervention {
        self.seen
            .lock()
            .unwrap()
            .push(self.status.is_ready(failure.service));
        self.decision
    }
}

#[tokio::test]
async fn test_not_ready_twice_then_ready_on_third_attempt() {
    let log = CallLog::new();
    let rig = ScriptedService::new("rig", &[Initialize, Test], &log);
    rig.fail_times(Stage::Test, Fault::NotReady, 2);

    let status = ComponentStatus::new();
    let probe = Arc::new(StatusProbe {
        status: status.clone(),
        seen: Mutex::new(Vec::new()),
        decision: Intervention::Retry,
    });
    let mut session = ExperimentSession::builder(context())
        .service(rig.shared())
        .status(status.clone())
        .runner(quick_runner(3).with_hook(probe.clone()))
        .build()
        .unwrap();

    session.configure().await.unwrap();
    session.initialize_and_test().await.unwrap();

    assert_eq!(log.count("rig.initialize"), 1);
    assert_eq!(log.count("rig.test"), 3);
    assert_eq!(*probe.seen.lock().unwrap(), [Some(false), Some(false)]);
    assert_eq!(status.is_ready("rig"), Some(true));
    assert_eq!(session.stage(), SessionStage::Ready);
}

#[tokio::test]
#[traced_test]
async fn test_retries_exhausted_names_service_and_stage() {
    let log = CallLog::new();
    let first = ScriptedService::new("first", &[Initialize, Test], &log);
    let flaky = ScriptedService::new("flaky", &[Initialize, Test], &log);
    let last = ScriptedService::new("last", &[Initialize], &log);
    flaky.fail_always(Stage::Initialize, Fault::Infrastructure);

    let mut session = ExperimentSession::builder(context())
        .services([first.shared(), flaky.shared(), last.shared()])
        .runner(quick_runner(2))
        .build()
        .unwrap();
    session.configure().await.unwrap();

    let err = session.initialize_and_test().await.unwrap_err();
    match &err {
        RigError::RetriesExhausted {
            service,
            stage,
            attempts,
            ..
        } => {
            assert_eq!(service, "flaky");
            assert_eq!(*stage, Stage::Initialize);
            assert_eq!(*attempts, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("flaky failed during initialize"));
    assert!(log.calls_for("last").is_empty());
    assert_eq!(session.status().is_ready("first"), Some(true));
    assert_eq!(session.status().is_ready("flaky"), Some(false));
    assert_eq!(session.stage(), SessionStage::Configured);
    assert!(logs_contain("Infrastructure error"));
    assert!(logs_contain("service=flaky"));
}

#[tokio::test]
async fn test_failed_stage_can_be_reinvoked() {
    let log = CallLog::new();
    let cam = ScriptedService::new("cam", &[Initialize, Test], &log);
    cam.fail_times(Stage::Initialize, Fault::Infrastructure, 2);

    let mut session = ExperimentSession::builder(context())
        .service(cam.shared())
        .runner(quick_runner(2))
        .build()
        .unwrap();
    session.configure().await.unwrap();

    assert!(session.initialize_and_test().await.is_err());
    assert_eq!(session.stage(), SessionStage::Configured);

    session.initialize_and_test().await.unwrap();
    assert_eq!(session.stage(), SessionStage::Ready);
    assert_eq!(log.count("cam.initialize"), 3);
    assert_eq!(log.count("cam.test"), 1);
}

#[tokio::test]
async fn test_operator_abort_stops_retrying() {
    let log = CallLog::new();
    let cam = ScriptedService::new("cam", &[Test], &log);
    cam.fail_always(Stage::Test, Fault::NotReady);

    let status = ComponentStatus::new();
    let hook = Arc::new(StatusProbe {
        status: status.clone(),
        seen: Mutex::new(Vec::new()),
        decision: Intervention::Abort,
    });
    let mut session = ExperimentSession::builder(context())
        .service(cam.shared())
        .status(status)
        .runner(quick_runner(5))
        .hook(hook)
        .build()
        .unwrap();
    session.configure().await.unwrap();

    let err = session.initialize_and_test().await.unwrap_err();
    assert!(matches!(err, RigError::Aborted { attempts: 1, .. }));
    assert_eq!(log.count("cam.test"), 1);
}

// =============================================================================
// Pretest
// =============================================================================

#[tokio::test]
async fn test_pretest_failure_propagates_without_retry() {
    let log = CallLog::new();
    let lick = ScriptedService::new("lick", &[Pretest], &log);
    let after = ScriptedService::new("after", &[Pretest], &log);
    lick.fail_always(Stage::Pretest, Fault::NotReady);

    let mut session = ExperimentSession::builder(context())
        .services([lick.shared(), after.shared()])
        .runner(quick_runner(3))
        .build()
        .unwrap();
    session.configure().await.unwrap();
    session.initialize_and_test().await.unwrap();

    let err = session.pretest().await.unwrap_err();
    assert!(matches!(
        err,
        RigError::Stage { ref service, stage: Stage::Pretest, .. } if service == "lick"
    ));
    assert_eq!(log.entries(), ["lick.pretest"]);
    assert_eq!(session.stage(), SessionStage::Ready);
}

// =============================================================================
// Configure
// =============================================================================

#[tokio::test]
async fn test_concrete_type_overrides_base_type() {
    let log = CallLog::new();
    let configurable = CapabilitySet::from_capabilities(&[Configure]);
    let base = leak_type("LayerBase".into(), &[], configurable);
    let derived = leak_type("LayerDerived".into(), &[base], configurable);
    let svc = ScriptedService::with_type("svc", derived, &log);

    let config = ConfigMap::new()
        .with("LayerBase", ServiceSettings::new().with("x", 1))
        .with("LayerDerived", ServiceSettings::new().with("x", 2).with("y", 3));
    let mut session = ExperimentSession::builder(context())
        .service(svc.shared())
        .config(config)
        .build()
        .unwrap();

    let report = session.configure().await.unwrap();

    assert_eq!(report.applied, ["svc"]);
    assert_eq!(svc.attribute("x"), Some(json!(2)));
    assert_eq!(svc.attribute("y"), Some(json!(3)));
}

#[tokio::test]
async fn test_configure_without_entry_is_idempotent() {
    let log = CallLog::new();
    let svc = ScriptedService::new("svc", &[Configure], &log);
    let other = ConfigMap::new().with("someone-else", ServiceSettings::new().with("x", 1));
    let mut session = ExperimentSession::builder(context())
        .service(svc.shared())
        .config(other)
        .build()
        .unwrap();

    let first = session.configure().await.unwrap();
    let second = session.configure().await.unwrap();

    assert_eq!(first.skipped, ["svc"]);
    assert_eq!(second.skipped, ["svc"]);
    assert!(svc.attributes().is_empty());
    assert!(log.entries().is_empty());
    assert_eq!(session.stage(), SessionStage::Configured);
}

#[tokio::test]
async fn test_rejected_settings_do_not_fail_configure() {
    let log = CallLog::new();
    let picky = ScriptedService::rejecting("picky", &log);
    let mut session = ExperimentSession::builder(context())
        .service(picky.shared())
        .config(ConfigMap::new().with("picky", ServiceSettings::new().with("gain", 2)))
        .build()
        .unwrap();

    let report = session.configure().await.unwrap();

    assert!(!report.is_clean());
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].0, "picky");
    assert_eq!(session.stage(), SessionStage::Configured);
}

#[tokio::test]
async fn test_configure_reapplies_settings_between_cycles() {
    let log = CallLog::new();
    let cam = ScriptedService::new("cam", &[Configure, Start, Stop], &log);
    let mut session = ExperimentSession::builder(context())
        .service(cam.shared())
        .group(RECORDERS, ["cam"])
        .config(ConfigMap::new().with("cam", ServiceSettings::new().with("gain", 1)))
        .build()
        .unwrap();
    session.configure().await.unwrap();
    session.initialize_and_test().await.unwrap();
    session.start(RECORDERS).await.unwrap();

    assert!(matches!(
        session.configure().await,
        Err(RigError::InvalidTransition { .. })
    ));
    session.stop(RECORDERS).await.unwrap();

    session.set_config(ConfigMap::new().with("cam", ServiceSettings::new().with("gain", 4)));
    let report = session.configure().await.unwrap();

    assert_eq!(report.applied, ["cam"]);
    assert_eq!(cam.attribute("gain"), Some(json!(4)));
    assert_eq!(log.count("cam.configure"), 2);
    assert_eq!(session.stage(), SessionStage::Stopped);
    session.start(RECORDERS).await.unwrap();
}

// =============================================================================
// Whole sessions
// =============================================================================

#[tokio::test]
async fn test_service_without_capabilities_is_never_called() {
    let log = CallLog::new();
    let inert = ScriptedService::new("inert", &[], &log);
    let busy = ScriptedService::new("busy", FULL, &log);

    let mut session = ExperimentSession::builder(context())
        .services([inert.shared(), busy.shared()])
        .config(ConfigMap::new().with("inert", ServiceSettings::new().with("x", 1)))
        .runner(quick_runner(1))
        .build()
        .unwrap();

    let configured = session.configure().await.unwrap();
    assert_eq!(configured.ignored, ["inert"]);
    session.initialize_and_test().await.unwrap();
    session.pretest().await.unwrap();
    session.start(ALL).await.unwrap();
    assert!(session.stop(ALL).await.unwrap().is_clean());
    assert!(session.validate().await.unwrap().is_clean());
    assert!(session.shutdown().await.unwrap().is_clean());

    assert!(log.calls_for("inert").is_empty());
    assert_eq!(log.calls_for("busy").len(), 9);
    assert_eq!(session.status().is_ready("inert"), Some(true));
    assert_eq!(session.stage(), SessionStage::Shutdown);
}

#[tokio::test]
async fn test_stop_all_stops_stimulus_before_recorders() {
    let log = CallLog::new();
    let sync = ScriptedService::new("sync", &[Start, Stop], &log);
    let stim = ScriptedService::new("stim", &[Start, Stop], &log);

    let mut session = ExperimentSession::builder(context())
        .services([sync.shared(), stim.shared()])
        .group(RECORDERS, ["sync"])
        .group(STIMULUS, ["stim"])
        .build()
        .unwrap();
    session.configure().await.unwrap();
    session.initialize_and_test().await.unwrap();
    session.start(RECORDERS).await.unwrap();
    session.start(STIMULUS).await.unwrap();

    let report = session.stop_all().await;

    assert!(report.is_clean());
    assert_eq!(
        log.entries(),
        ["sync.start", "stim.start", "stim.stop", "sync.stop"]
    );
    assert_eq!(session.stage(), SessionStage::Stopped);
}

#[tokio::test]
async fn test_session_order_is_call_order_including_duplicates() {
    let log = CallLog::new();
    let a = ScriptedService::new("A", &[Pretest], &log);
    let b = ScriptedService::new("B", &[Pretest], &log);

    let mut session = ExperimentSession::builder(context())
        .services([b.shared(), a.shared(), b.shared()])
        .build()
        .unwrap();
    session.configure().await.unwrap();
    session.initialize_and_test().await.unwrap();
    session.pretest().await.unwrap();

    assert_eq!(log.entries(), ["B.pretest", "A.pretest", "B.pretest"]);
}
