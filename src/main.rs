//! # maas-operator
//!
//! Entry point invoked by the platform glue once per lifecycle event, per
//! action, or as a long-running consumer of a JSON event stream.
//!
//! ## Initialization Sequence
//!
//! 1. **Tracing** - structured logs to stderr, filtered by `RUST_LOG`
//! 2. **Configuration** - defaults, TOML file, `MAAS_OPERATOR_*` overrides
//! 3. **Adaptors** - file-backed runtime, snap workload, service commands,
//!    S3 object storage
//! 4. **Reconciler** - loads the applied-state marker from the config dir
//!
//! Reports are printed to stdout as JSON so the caller can relay status and
//! action results back to the orchestration runtime.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use maas_operator::cli::{Cli, Commands, Report, build_action, build_event};
use maas_operator::{CommandSupervisor, CommandWorkload, FileRuntime, S3Stores};
use maas_operator_core::OperatorConfig;
use maas_operator_reconciler::r#loop::DEFAULT_CAPACITY;
use maas_operator_reconciler::{
    ArtifactStore, Event, EventLoop, Handled, Policy, Reconciler, Status,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = OperatorConfig::load(cli.config.as_deref())
        .context("Failed to load operator configuration")?;
    let mut reconciler = init_reconciler(&config)?;

    match cli.command {
        Commands::Handle {
            event,
            relation,
            relation_id,
            unit,
        } => {
            let event = build_event(event, relation, relation_id, unit)?;
            let handled = reconciler.handle(event).await;
            print_report(&handled)?;
            if matches!(handled.status, Status::Error(_)) {
                bail!("{}", handled.status);
            }
        }
        Commands::Action { name, params } => {
            let request = build_action(name, params);
            let handled = reconciler.handle(Event::ActionInvoked(request)).await;
            print_report(&handled)?;
            if let Some(Err(e)) = &handled.action {
                bail!("action failed: {e}");
            }
        }
        Commands::Run => run_stream(reconciler).await?,
        Commands::Render => {
            let artifacts = reconciler
                .preview()
                .await
                .context("Nothing to render with the current inputs")?;
            let mut stdout = std::io::stdout().lock();
            for artifact in artifacts {
                writeln!(
                    stdout,
                    "# {} (mode {:o})",
                    config.config_dir.join(&artifact.path).display(),
                    artifact.mode
                )?;
                writeln!(stdout, "{}", artifact.contents.trim_end())?;
            }
        }
    }
    Ok(())
}

/// Initialize tracing subscriber with environment filter.
///
/// Logs go to stderr; stdout carries the JSON reports.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Wire the host adaptors into a reconciler.
fn init_reconciler(config: &OperatorConfig) -> Result<Reconciler> {
    let reconciler = Reconciler::builder()
        .with_runtime(Arc::new(FileRuntime::new(&config.runtime_dir)))
        .with_workload(Arc::new(CommandWorkload::from_config(config)))
        .with_supervisor(Arc::new(CommandSupervisor::from_config(config)))
        .with_object_stores(Arc::new(S3Stores))
        .with_store(ArtifactStore::new(
            &config.config_dir,
            config.state_file.clone(),
        ))
        .with_policy(Policy::from_config(config))
        .build()
        .context("Failed to build reconciler")?;
    info!(
        config_dir = %config.config_dir.display(),
        runtime_dir = %config.runtime_dir.display(),
        "reconciler ready"
    );
    Ok(reconciler)
}

fn print_report(handled: &Handled) -> Result<()> {
    let line = serde_json::to_string(&Report::from(handled)).context("Failed to encode report")?;
    writeln!(std::io::stdout().lock(), "{line}")?;
    Ok(())
}

/// Handle JSON events from stdin until EOF or Ctrl+C.
async fn run_stream(reconciler: Reconciler) -> Result<()> {
    let (outcome_tx, mut outcomes) = mpsc::channel::<Handled>(DEFAULT_CAPACITY);
    let (events, event_loop) = EventLoop::new(reconciler, DEFAULT_CAPACITY);
    let worker = tokio::spawn(event_loop.with_sink(outcome_tx).run());
    let printer = tokio::spawn(async move {
        while let Some(handled) = outcomes.recv().await {
            if let Err(e) = print_report(&handled) {
                error!(error = %e, "failed to print report");
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read events from stdin")?,
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, finishing queued events"),
                    Err(err) => error!("Failed to listen for shutdown signal: {}", err),
                }
                None
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(&line) {
            Ok(event) => {
                if events.send(event).await.is_err() {
                    warn!("event loop stopped early");
                    break;
                }
            }
            Err(e) => warn!(error = %e, "skipping malformed event"),
        }
    }

    drop(events);
    let reconciler = worker.await.context("Event loop task failed")?;
    printer.await.context("Report printer task failed")?;
    info!(status = %reconciler.status(), "event stream finished");
    Ok(())
}
