//! # kronos_app: boot binary
//!
//! Wires the stock modules and a small demo module into a [`Framework`] and
//! runs it.
//!
//! ## Startup sequence
//!
//! 1. Load the configuration: defaults, then `--config` (JSON), then
//!    `KRONOS_TICK_MS`, then `--tick-ms`.
//! 2. Add the scheduler, health, command and demo modules and initialize
//!    them.
//! 3. Register every active component with the health monitor.
//! 4. Start the framework and run until Ctrl-C or `--run-secs` elapsed.
//! 5. Shut everything down.

mod demo;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kronos_cmd::{CmdModule, CommandDispatcher};
use kronos_core::{Framework, KronosConfig};
use kronos_health::{HealthModule, HealthMonitor};
use kronos_sched::{SchedModule, Scheduler};
use tracing::info;
use tracing_subscriber::EnvFilter;

use demo::DemoModule;

#[derive(Parser)]
#[command(name = "kronos_app", about = "Kronos component framework demo")]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base tick interval in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Stop after this many seconds (0 = run until Ctrl-C)
    #[arg(long, default_value_t = 0)]
    run_secs: u64,
}

fn load_config(args: &Args) -> Result<KronosConfig> {
    let config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            KronosConfig::from_json(&json)?
        }
        None => KronosConfig::default(),
    };
    let mut config = config.with_env_overrides();
    if let Some(ms) = args.tick_ms {
        config = config.with_tick_interval(Duration::from_millis(ms));
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("kronos_app=info".parse()?))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    info!(
        tick_ms = config.scheduler.base_interval_ms,
        workers = config.scheduler.workers.len(),
        "configuration loaded"
    );

    let mut framework = Framework::new(config);
    let scheduler = Arc::new(Scheduler::new(
        framework.config().scheduler.clone(),
        Arc::clone(framework.pool()),
    ));
    let monitor = Arc::new(HealthMonitor::new(
        framework.config().health.clone(),
        framework.pool(),
    ));

    let dispatcher = Arc::new(CommandDispatcher::new(framework.pool()));

    framework.add_module(SchedModule::new(Arc::clone(&scheduler)))?;
    framework.add_module(HealthModule::new(Arc::clone(&monitor), Arc::clone(&scheduler)))?;
    framework.add_module(CmdModule::new(Arc::clone(&dispatcher), Arc::clone(&scheduler)))?;
    framework.add_module(DemoModule::new(Arc::clone(&scheduler), dispatcher))?;
    framework.init_modules()?;

    let monitored = monitor.register_active_components(&framework)?;
    info!(monitored, "active components registered with health monitor");

    framework.start()?;

    if args.run_secs > 0 {
        tokio::time::sleep(Duration::from_secs(args.run_secs)).await;
    } else {
        tokio::signal::ctrl_c().await?;
    }

    info!(
        ticks = scheduler.tick_count(),
        workers = %serde_json::to_string(&scheduler.status())?,
        "scheduler status"
    );
    framework.shutdown();
    Ok(())
}
