//! # Flowrun CLI
//!
//! Command-line front end for previewing, submitting and following task and
//! flow runs against the configured engine.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use flowrun_core::compiler::{CompilerOptions, DagCompiler};
use flowrun_core::config::FlowrunConfig;
use flowrun_core::engine::ArgoEngineClient;
use flowrun_core::logging::init_structured_logging;
use flowrun_core::logs::{
    forward_to_observer, BackoffPolicy, ConnectionState, ForwardOutcome, LogUpdate,
    ObserverTransport, TransportError,
};
use flowrun_core::models::{FlowDefinition, RunOverrides, TaskDefinition};
use flowrun_core::service::FlowrunService;
use flowrun_core::store::PgRunStore;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "flowrun-cli")]
#[command(about = "Preview, submit and follow flowrun tasks and flows")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (TOML); FLOWRUN__* environment variables override it
    #[arg(short, long, env = "FLOWRUN_CONFIG")]
    config: Option<PathBuf>,

    /// Keep runs in memory instead of PostgreSQL (state is lost on exit)
    #[arg(long)]
    in_memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the job manifest a flow definition compiles to, without submitting it
    Preview {
        /// Flow definition (JSON)
        flow: PathBuf,
    },

    /// Create a task from a Python script and submit it
    SubmitTask {
        script: PathBuf,

        /// Task name (default: the script's file stem)
        #[arg(long)]
        name: Option<String>,

        /// Whitespace or comma separated pip packages
        #[arg(long)]
        packages: Option<String>,

        /// requirements.txt installed instead of --packages
        #[arg(long)]
        requirements: Option<PathBuf>,

        /// Whitespace or comma separated OS packages
        #[arg(long)]
        system_packages: Option<String>,

        /// Stream logs until the run finishes
        #[arg(short, long)]
        follow: bool,
    },

    /// Create a flow from a JSON definition and submit it
    SubmitFlow {
        flow: PathBuf,

        /// Stream logs until the run finishes
        #[arg(short, long)]
        follow: bool,
    },

    /// Print the logs of a run
    Logs {
        run_id: Uuid,

        /// Keep streaming until the run finishes
        #[arg(short, long)]
        follow: bool,
    },

    /// Ask the engine to stop a run
    Cancel { run_id: Uuid },

    /// Reconcile active runs until interrupted
    Reconcile {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Apply database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = FlowrunConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_structured_logging(&config.logging);

    match cli.command {
        Commands::Preview { flow } => {
            let definition = read_flow(&flow)?;
            let compiler = DagCompiler::new(CompilerOptions::from(&config.engine));
            let manifest = compiler.preview(&definition.steps, &definition.edges)?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }

        Commands::SubmitTask {
            script,
            name,
            packages,
            requirements,
            system_packages,
            follow,
        } => {
            let service = build_service(config, cli.in_memory).await?;
            let mut definition = TaskDefinition::new(
                name.unwrap_or_else(|| file_stem(&script)),
                read_file(&script)?,
            );
            definition.package_dependencies = packages;
            definition.requirements = requirements.as_deref().map(read_file).transpose()?;
            definition.system_dependencies = system_packages;

            let task = service.create_task(&definition).await?;
            let run = service
                .submit_task(task.task_id, &RunOverrides::none())
                .await?;
            println!(
                "task {} run #{} submitted as {}",
                task.task_id, run.run_number, run.task_run_id
            );
            if follow {
                follow_run(&service, run.task_run_id).await?;
            }
        }

        Commands::SubmitFlow { flow, follow } => {
            let service = build_service(config, cli.in_memory).await?;
            let definition = read_flow(&flow)?;
            let created = service.create_flow(&definition).await?;
            let detail = service.submit_flow(created.flow_id).await?;
            println!(
                "flow {} run #{} submitted as {} ({} steps)",
                created.flow_id,
                detail.run.run_number,
                detail.run.flow_run_id,
                detail.steps.len()
            );
            if follow {
                follow_run(&service, detail.run.flow_run_id).await?;
            }
        }

        Commands::Logs { run_id, follow } => {
            let service = build_service(config, cli.in_memory).await?;
            if follow {
                follow_run(&service, run_id).await?;
            } else {
                for entry in service.get_logs(run_id).await? {
                    println!("==> {} ({}) <==", entry.step_id, entry.phase);
                    print!("{}", entry.content);
                }
            }
        }

        Commands::Cancel { run_id } => {
            let service = build_service(config, cli.in_memory).await?;
            let outcome = service.cancel(run_id).await?;
            println!("{run_id}: {outcome:?}");
        }

        Commands::Reconcile { once } => {
            let service = build_service(config, cli.in_memory).await?;
            let reconciler = Arc::new(service.reconciler());
            if once {
                let summary = reconciler.reconcile_once().await?;
                println!(
                    "examined {} runs: {} transitioned, {} unchanged, {} failed",
                    summary.examined, summary.transitioned, summary.unchanged, summary.failed
                );
            } else {
                let (handle, shutdown) = reconciler.spawn();
                tokio::signal::ctrl_c().await?;
                info!("Shutdown requested");
                let _ = shutdown.send(true);
                handle.await?;
            }
        }

        Commands::Migrate => {
            let store = PgRunStore::connect(&config.database).await?;
            store.migrate().await?;
            info!("✅ Migrations applied");
        }
    }

    Ok(())
}

async fn build_service(config: FlowrunConfig, in_memory: bool) -> Result<FlowrunService> {
    if in_memory {
        let engine = ArgoEngineClient::new(&config.engine)?;
        return Ok(FlowrunService::in_memory(Arc::new(engine), config));
    }
    Ok(FlowrunService::from_config(config).await?)
}

/// Stream a run's logs to stdout until it finishes, reconciling in the background.
async fn follow_run(service: &FlowrunService, run_id: Uuid) -> Result<()> {
    // stored phases only advance while something reconciles
    let (reconciler, shutdown) = Arc::new(service.reconciler()).spawn();

    let subscription = service.stream_logs(run_id).await?;
    let (state_tx, _state_rx) = watch::channel(ConnectionState::Connected);
    let policy = BackoffPolicy::from(&service.config().observer);
    let mut terminal = TerminalObserver::default();

    let outcome = forward_to_observer(subscription, &mut terminal, &policy, &state_tx).await;

    let _ = shutdown.send(true);
    reconciler.await?;

    match outcome {
        ForwardOutcome::Completed(phase) => println!("run {run_id} finished: {phase}"),
        ForwardOutcome::StreamClosed => println!("log stream for {run_id} closed"),
        ForwardOutcome::ObserverLost { attempts } => {
            bail!("could not write to the terminal after {attempts} attempts")
        }
    }
    Ok(())
}

/// Prints only the log text not yet shown, prefixed by step id
#[derive(Default)]
struct TerminalObserver {
    printed: HashMap<String, usize>,
}

#[async_trait]
impl ObserverTransport for TerminalObserver {
    async fn send(&mut self, update: &LogUpdate) -> Result<(), TransportError> {
        let mut out = String::new();
        match update {
            LogUpdate::Snapshot { entries, .. } => {
                for entry in entries {
                    let seen = self.printed.entry(entry.step_id.clone()).or_default();
                    if let Some(new_text) = entry.content.get(*seen..) {
                        for line in new_text.lines() {
                            out.push_str(&format!("[{}] {line}\n", entry.step_id));
                        }
                    }
                    *seen = entry.content.len().max(*seen);
                }
            }
            LogUpdate::StatusUnknown { reason, .. } => {
                out.push_str(&format!("(engine status unknown: {reason})\n"));
            }
            LogUpdate::Completed { .. } => {}
        }

        let mut stdout = std::io::stdout();
        stdout
            .write_all(out.as_bytes())
            .and_then(|()| stdout.flush())
            .map_err(|e| TransportError::Disconnected(e.to_string()))
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn read_flow(path: &Path) -> Result<FlowDefinition> {
    serde_json::from_str(&read_file(path)?)
        .with_context(|| format!("parsing flow definition {}", path.display()))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "task".to_string())
}
