//! Command-line driver for a simulated rig.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use rig_orchestrator::capabilities::Stage;
use rig_orchestrator::data_files::ArtifactCollector;
use rig_orchestrator::instruments::SimulatedRig;
use rig_orchestrator::registry::ServiceRegistry;
use rig_orchestrator::runner::{AttemptFailure, Intervention, InterventionHook};
use rig_orchestrator::session::{ExperimentSession, SessionContext, RECORDERS, STIMULUS};
use rig_orchestrator::watcher::wait_until_idle;
use rig_orchestrator::{logging, RigConfig, RigResult, Service};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "rig_orchestrator", version, about = "Run experiment sessions on a lab rig")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a full session on the simulated rig
    Run(RunArgs),
    /// Print the capabilities of every simulated service
    Capabilities,
    /// Load and validate a configuration file
    CheckConfig {
        #[arg(long, default_value = "config/rig.toml")]
        config: PathBuf,
        /// Print the effective configuration as TOML
        #[arg(long)]
        print: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, default_value = "config/rig.toml")]
    config: PathBuf,
    /// Subject (mouse) identifier
    #[arg(long)]
    subject: String,
    #[arg(long)]
    operator: String,
    #[arg(long, default_value = "behavior")]
    experiment_type: String,
    /// Acquisitions to run between initialize and shutdown
    #[arg(long, default_value_t = 1)]
    cycles: u32,
    /// Give up on the stimulus after this many seconds
    #[arg(long)]
    stimulus_timeout_secs: Option<u64>,
    /// Ask on the terminal before retrying a failed initialize or test
    #[arg(long)]
    interactive: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Capabilities => {
            logging::init("warn", false)?;
            print_capabilities()
        }
        Command::CheckConfig { config, print } => check_config(&config, print),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = RigConfig::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    logging::init(&config.application.log_level, config.application.json_logs)?;

    let context = SessionContext::new(args.subject, args.operator, args.experiment_type);
    let data_root = config.session.data_root.clone();
    let scratch = data_root
        .join(".scratch")
        .join(context.session_id.to_string());
    let rig = SimulatedRig::new(&scratch);

    let mut builder = ExperimentSession::configured_builder(context, rig.services(), &config);
    if args.interactive {
        builder = builder.hook(Arc::new(OperatorPrompt));
    }
    let mut session = builder.build()?;
    info!(
        rig = %config.application.name,
        session = %session.context().session_id,
        subject = %session.context().subject,
        "Session ready to configure"
    );

    let mut status = session.status().subscribe();
    let status_task = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let snapshot = status.borrow_and_update().clone();
            let ready = snapshot.values().filter(|ready| **ready).count();
            info!(ready, total = snapshot.len(), "Component status changed");
        }
    });

    let timeout = args.stimulus_timeout_secs.map(Duration::from_secs);
    let outcome = drive(&mut session, &rig, &config, args.cycles, timeout).await;
    if let Err(e) = &outcome {
        error!(error = %e, "Session failed, shutting down");
    }

    let shutdown = session.shutdown().await?;
    for failure in &shutdown.failures {
        warn!(%failure, "Shutdown failure");
    }
    status_task.abort();

    let collector = ArtifactCollector::for_session(&data_root, session.context());
    let collected = collector.collect(session.services()).await?;
    println!(
        "Collected {} artifact(s) into {}",
        collected.len(),
        collector.destination().display()
    );
    for artifact in &collected {
        println!("  {:<12} {}", artifact.service, artifact.destination.display());
    }

    outcome.with_context(|| format!("session {}", session.context().session_id))
}

async fn drive(
    session: &mut ExperimentSession,
    rig: &SimulatedRig,
    config: &RigConfig,
    cycles: u32,
    stimulus_timeout: Option<Duration>,
) -> RigResult<()> {
    let report = session.configure().await?;
    for (service, error) in &report.rejected {
        warn!(service = %service, error = %error, "Settings rejected, running with previous values");
    }
    session.initialize_and_test().await?;

    let poll_interval = config.session.poll_interval();
    for cycle in 1..=cycles {
        info!(cycle, cycles, "Starting acquisition");
        session.pretest().await?;
        session.start(RECORDERS).await?;

        let played = session
            .run_group(STIMULUS, || {
                wait_until_idle(
                    rig.stimulus.name(),
                    rig.stimulus.clone(),
                    poll_interval,
                    stimulus_timeout,
                )
            })
            .await;
        let stopped = session.stop(RECORDERS).await?;
        let polls = played?;
        info!(cycle, polls, "Stimulus finished");

        stopped.into_result()?;
        let validation = session.validate().await?;
        for failure in &validation.failures {
            warn!(%failure, "Validation failed");
        }
    }
    Ok(())
}

fn print_capabilities() -> Result<()> {
    let rig = SimulatedRig::new(std::env::temp_dir());
    let mut registry = ServiceRegistry::new();
    for service in rig.services() {
        registry.register(service)?;
    }

    println!("{:<12} {:<18} {:<24} CAPABILITIES", "SERVICE", "TYPE", "LINEAGE");
    for entry in registry.all(None) {
        let ty = entry.service.service_type();
        let lineage: Vec<&str> = ty.lineage().iter().map(|t| t.name).collect();
        println!(
            "{:<12} {:<18} {:<24} {}",
            entry.service.name(),
            ty.name,
            lineage.join(" > "),
            entry.capabilities
        );
    }
    Ok(())
}

fn check_config(path: &Path, print: bool) -> Result<()> {
    let config =
        RigConfig::load_from(path).with_context(|| format!("loading {}", path.display()))?;
    if print {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }
    println!("{} is valid", path.display());
    println!("  rig:          {}", config.application.name);
    println!("  log level:    {}", config.application.log_level);
    println!("  max attempts: {}", config.session.max_attempts);
    println!("  data root:    {}", config.session.data_root.display());
    println!("  recorders:    {}", config.session.recorders.join(", "));
    println!("  stimulus:     {}", config.session.stimulus.join(", "));
    for (key, settings) in &config.services {
        let keys: Vec<&str> = settings.keys().collect();
        println!("  [services.{}] {}", key, keys.join(", "));
    }
    Ok(())
}

/// Asks the operator on the terminal whether to retry.
struct OperatorPrompt;

#[async_trait]
impl InterventionHook for OperatorPrompt {
    async fn intervene(&self, failure: &AttemptFailure<'_>) -> Intervention {
        let action = if failure.stage == Stage::Test {
            "check the device"
        } else {
            "check the connection"
        };
        let prompt = format!(
            "{} failed {} (attempt {}/{}): {}\nPlease {}, then retry? [Y/n] ",
            failure.service,
            failure.stage,
            failure.attempt,
            failure.max_attempts,
            failure.error,
            action
        );

        let mut stdout = tokio::io::stdout();
        if stdout.write_all(prompt.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            return Intervention::Retry;
        }

        let mut answer = String::new();
        match BufReader::new(tokio::io::stdin()).read_line(&mut answer).await {
            Ok(_) if answer.trim().eq_ignore_ascii_case("n") => Intervention::Abort,
            _ => Intervention::Retry,
        }
    }
}
