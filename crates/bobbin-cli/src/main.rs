//! bobbin - scheduler entry point and operator control surface.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bobbin_core::app::{ControlReport, Scheduler};
use bobbin_core::domain::{Application, ControlError, EngineError, StoreError, TaskId};
use bobbin_core::impls::FileTaskStore;
use bobbin_core::tasks::{FanOut, SingleJob, TaskTree};
use bobbin_core::{Engine, EngineBuilder};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod guard;
mod settings;

use guard::SchedulerGuard;
use settings::Settings;

/// bobbin - lease-driven task execution engine
#[derive(Parser)]
#[command(name = "bobbin")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default ~/.bobbin/bobbin.toml)
    #[arg(long, env = "BOBBIN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// One scheduler pass over all eligible tasks
    Run {
        /// Keep running, one pass every SECS seconds, until Ctrl-C
        #[arg(long, value_name = "SECS")]
        every: Option<u64>,
    },
    /// Step one task and its children in the foreground until it leaves PAUSED
    Drive { id: TaskId },
    /// Kill a task and all its descendants
    Kill { id: TaskId },
    /// Put an ERROR task (and ERROR descendants) back in the scheduler's queue
    Retry { id: TaskId },
    /// Show one task
    Info {
        id: TaskId,
        #[arg(long)]
        long: bool,
    },
    /// Administrative pause: the scheduler skips HOLD tasks
    Hold { id: TaskId },
    /// Release a HOLD back to PAUSED
    Resume { id: TaskId },
    /// List tasks, optionally only those active in the last N hours
    Show {
        #[arg(long, value_name = "N")]
        hours_ago: Option<u32>,
    },
    /// Counts per transition
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Create a new task
    Submit {
        #[command(subcommand)]
        kind: SubmitKind,
    },
}

#[derive(Subcommand)]
enum SubmitKind {
    /// One job
    Single {
        #[command(flatten)]
        app: AppArgs,
    },
    /// WIDTH identical jobs, waited on together
    FanOut {
        #[arg(long)]
        width: u32,
        #[command(flatten)]
        app: AppArgs,
    },
    /// A tree of DEPTH levels with BRANCHING children per node
    Tree {
        #[arg(long, default_value_t = 2)]
        depth: u32,
        #[arg(long, default_value_t = 2)]
        branching: u32,
        #[command(flatten)]
        app: AppArgs,
    },
}

#[derive(Args)]
struct AppArgs {
    #[arg(long)]
    name: String,
    #[arg(long = "exec")]
    executable: String,
    /// Repeat for each argument
    #[arg(long = "arg")]
    arguments: Vec<String>,
    #[arg(long, default_value_t = 1)]
    cores: u32,
    /// MB per core
    #[arg(long, default_value_t = 0)]
    memory: u64,
    /// Seconds
    #[arg(long, default_value_t = 0)]
    walltime: u64,
}

impl AppArgs {
    fn into_application(self) -> Application {
        Application::new(self.name, self.executable)
            .with_args(self.arguments)
            .with_cores(self.cores)
            .with_memory(self.memory)
            .with_walltime(self.walltime)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// 2 for an unknown task id, 1 for everything else.
fn exit_code(err: &anyhow::Error) -> u8 {
    let missing = err.chain().any(|cause| {
        matches!(cause.downcast_ref::<ControlError>(), Some(ControlError::NotFound(_)))
            || matches!(cause.downcast_ref::<StoreError>(), Some(StoreError::NotFound(_)))
            || matches!(
                cause.downcast_ref::<EngineError>(),
                Some(EngineError::Store(StoreError::NotFound(_)))
            )
    });
    if missing { 2 } else { 1 }
}

async fn build_engine(settings: &Settings) -> Result<Engine> {
    let store = FileTaskStore::open(&settings.store.path)
        .await
        .with_context(|| format!("opening store {}", settings.store.path.display()))?;
    let backends = settings
        .resources()
        .into_iter()
        .map(|resource| resource.into_lrms(&settings.engine.user));
    let engine = EngineBuilder::new()
        .store(Arc::new(store))
        .backends(backends)
        .config(settings.engine.clone())
        .with_builtin_tasks()?
        .build()?;
    Ok(engine)
}

async fn dispatch(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref())?;
    let engine = build_engine(&settings).await?;

    match cli.command {
        Commands::Run { every } => {
            let lock_path = settings.scheduler_lock_path();
            let Some(_guard) = SchedulerGuard::try_acquire(&lock_path)
                .with_context(|| format!("taking scheduler lock {}", lock_path.display()))?
            else {
                info!(lock = %lock_path.display(), "another scheduler is running, nothing to do");
                return Ok(());
            };
            let scheduler = Scheduler::new(Arc::new(engine));
            match every {
                None => {
                    scheduler.run().await;
                }
                Some(secs) => {
                    let (shutdown_tx, shutdown_rx) = watch::channel(false);
                    tokio::spawn(async move {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            info!("shutdown requested");
                            // ignore send error: the scheduler may already be gone
                            let _ = shutdown_tx.send(true);
                        }
                    });
                    let passes = scheduler
                        .run_every(Duration::from_secs(secs.max(1)), shutdown_rx)
                        .await;
                    info!(passes, "scheduler stopped");
                }
            }
        }
        Commands::Drive { id } => {
            let record = engine.run(id).await?;
            println!("{} {} {}", record.id, record.state, record.transition);
        }
        Commands::Kill { id } => {
            let report = engine.control().kill(id).await?;
            print_report("killed", &report);
        }
        Commands::Retry { id } => {
            let report = engine.control().retry(id).await?;
            if !report.was_changed(id) {
                println!("{id} is not in ERROR, left as is");
            }
            print_report("retried", &report);
        }
        Commands::Info { id, long } => {
            print!("{}", engine.control().info(id, long).await?);
        }
        Commands::Hold { id } => {
            if engine.control().hold(id).await? {
                println!("{id} is on hold");
            } else {
                println!("{id} is not PAUSED or ERROR, left as is");
            }
        }
        Commands::Resume { id } => {
            if engine.control().resume(id).await? {
                println!("{id} resumed");
            } else {
                println!("{id} was not on hold");
            }
        }
        Commands::Show { hours_ago } => {
            for record in engine.control().show(hours_ago).await? {
                println!(
                    "{} {:<24} {:<12} {}",
                    record.id, record.task_type, record.state, record.transition
                );
            }
        }
        Commands::Status { json } => {
            let summary = engine.control().status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{summary}");
            }
        }
        Commands::Submit { kind } => {
            let id = match kind {
                SubmitKind::Single { app } => {
                    SingleJob::submit(&engine, app.into_application()).await?
                }
                SubmitKind::FanOut { width, app } => {
                    FanOut::spawn(&engine, width, app.into_application()).await?
                }
                SubmitKind::Tree {
                    depth,
                    branching,
                    app,
                } => TaskTree::spawn(&engine, depth, branching, app.into_application()).await?,
            };
            println!("{id}");
        }
    }
    Ok(())
}

fn print_report(verb: &str, report: &ControlReport) {
    println!("{verb} {} task(s)", report.changed.len());
    for (id, reason) in &report.failed {
        println!("  {id}: {reason}");
    }
}
