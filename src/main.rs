//! Command line front end.
//!
//! ```text
//! daq_protocol run <template> [--thread] [--skip-check] [--observe <entry>]...
//! daq_protocol check <template> [--test-instruments]
//! daq_protocol tasks
//! daq_protocol worker            # spawned by `run`, speaks JSON lines on stdio
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use rust_daq_protocol::config::{EngineConfig, WorkerMode};
use rust_daq_protocol::database::TaskDatabase;
use rust_daq_protocol::execution::{
    serve_stdio, EngineState, ExecutionEngine, RuntimeContext, WorkerRegistries,
};
use rust_daq_protocol::instrument::InstrumentPool;
use rust_daq_protocol::logging;
use rust_daq_protocol::monitor::TextMonitor;
use rust_daq_protocol::preferences::load_template;
use rust_daq_protocol::tasks::{CheckOptions, RootContext};

#[derive(Parser)]
#[command(name = "daq_protocol")]
#[command(about = "Measurement protocol runner", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a protocol template
    Run {
        /// Template file
        template: PathBuf,

        /// Host the worker on a thread instead of a child process
        #[arg(long)]
        thread: bool,

        /// Do not check the tree before running it
        #[arg(long)]
        skip_check: bool,

        /// Only relay these entries (repeatable)
        #[arg(long = "observe")]
        observe: Vec<String>,
    },

    /// Check a protocol template without running it
    Check {
        /// Template file
        template: PathBuf,

        /// Open every instrument connection used by the tree
        #[arg(long)]
        test_instruments: bool,
    },

    /// List the known task and driver types
    Tasks,

    /// Serve one run over stdin / stdout
    #[command(hide = true)]
    Worker {
        /// Log filter for the worker
        #[arg(long, default_value = "info")]
        log_level: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Worker { log_level } = &cli.command {
        logging::init_worker_tracing(log_level)?;
        let state = serve_stdio(&WorkerRegistries::default())?;
        info!(state = %state, "Worker done");
        return Ok(());
    }

    let config = EngineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    logging::init_tracing(&config.logging)?;
    let registries = WorkerRegistries::default();
    config.validate_drivers(&registries.drivers)?;

    let code = match cli.command {
        Commands::Run {
            template,
            thread,
            skip_check,
            observe,
        } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run(config, registries, &template, thread, skip_check, observe))?
        }
        Commands::Check {
            template,
            test_instruments,
        } => check(&config, &registries, &template, test_instruments)?,
        Commands::Tasks => {
            println!("tasks:   {}", registries.tasks.task_ids().join(", "));
            println!("drivers: {}", registries.drivers.driver_types().join(", "));
            0
        }
        Commands::Worker { .. } => 0,
    };
    std::process::exit(code);
}

async fn run(
    config: EngineConfig,
    registries: WorkerRegistries,
    template: &Path,
    thread: bool,
    skip_check: bool,
    observe: Vec<String>,
) -> Result<i32> {
    let template = load_template(template)
        .with_context(|| format!("Failed to load template {}", template.display()))?;
    if !template.doc.is_empty() {
        info!("{}", template.doc);
    }

    let mut worker = config.worker.clone();
    if thread {
        worker.mode = WorkerMode::Thread;
    }
    let engine = ExecutionEngine::new(worker, registries).with_log_level(&config.logging.level);
    let monitor = TextMonitor::new().into_handle();
    engine.add_monitor(monitor.clone());

    let mut context = RuntimeContext::new();
    context.profiles = config.profiles.clone();
    context.observed_entries = observe;
    context.skip_check = skip_check || config.run.skip_check;
    context.check = CheckOptions {
        test_instruments: config.run.test_instruments,
    };

    let handle = engine.start(context, template.preferences).await?;
    let controller = handle.controller();
    // First Ctrl-C stops the run, the next ones force it.
    let interrupts = tokio::spawn(async move {
        let mut count = 0;
        while tokio::signal::ctrl_c().await.is_ok() {
            count += 1;
            if count == 1 {
                warn!("Interrupted, stopping run (Ctrl-C again to force)");
                controller.stop();
            } else {
                warn!("Interrupted again, forcing stop");
                controller.force_stop();
            }
        }
    });
    let outcome = handle.wait().await;
    interrupts.abort();
    let outcome = outcome?;

    for entry in monitor.lock().displayed_entries() {
        println!("{} = {}", entry.path, entry.value());
    }
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    Ok(match outcome.state {
        EngineState::Completed => 0,
        EngineState::Interrupted => 2,
        _ => 1,
    })
}

fn check(
    config: &EngineConfig,
    registries: &WorkerRegistries,
    template: &Path,
    test_instruments: bool,
) -> Result<i32> {
    let template = load_template(template)
        .with_context(|| format!("Failed to load template {}", template.display()))?;
    let instruments = Arc::new(InstrumentPool::new(
        registries.drivers.clone(),
        config.profiles.clone(),
    ));
    let context = Arc::new(RootContext::new(Arc::new(TaskDatabase::new()), instruments.clone()));
    let root = registries.tasks.build_root(&template.preferences, context)?;
    let report = root.check(&CheckOptions {
        test_instruments: test_instruments || config.run.test_instruments,
    });
    instruments.close_all();
    if report.is_ok() {
        println!("check passed");
        Ok(0)
    } else {
        warn!("Check failed");
        println!("{}", report);
        Ok(1)
    }
}
