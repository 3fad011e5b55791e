//! `uvmhost-plan` entry point.
//!
//! Usage: `uvmhost-plan <plan.json>` (`-` reads the plan from stdin).
//!
//! The report is printed to stdout as JSON; logs go to stderr. Runs
//! sharing a state directory are serialized through an advisory lock.

use anyhow::Context;
use std::io::Read;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uvmhost_cli::{Plan, PlanConfig, PlanRunner};
use uvmhost_core::{DirProvisioner, FileLock, LifecycleOrchestrator};
use uvmhost_vm::SimulatedEngine;

fn main() -> anyhow::Result<()> {
    // Logs go to stderr (stdout carries the report)
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("uvmhost=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let path = std::env::args()
        .nth(1)
        .context("usage: uvmhost-plan <plan.json | ->")?;
    let json = if path == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(&path).with_context(|| format!("reading plan {}", path))?
    };
    let plan = Plan::from_json(&json).context("parsing plan")?;

    let config = PlanConfig::from_env();
    tracing::info!(?config, "Configuration loaded");
    config.validate()?;

    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("creating state directory {}", config.state_dir.display()))?;
    let mut lock = FileLock::open(config.lock_path())?;
    let _guard = lock
        .lock(true, &config.lock_policy())
        .with_context(|| format!("locking {}", config.lock_path().display()))?;

    let engine = Arc::new(SimulatedEngine::new());
    let orchestrator = LifecycleOrchestrator::new(config.host_config()?, engine.clone())?;
    let provisioner = DirProvisioner::new(config.scratch_root());

    tracing::info!(entries = plan.entries.len(), "Running plan");
    let report = PlanRunner::new(&orchestrator, &*engine, &provisioner).run(&plan);

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.failed() > 0 || !report.teardown_errors.is_empty() {
        anyhow::bail!(
            "{} entries failed, {} teardown errors",
            report.failed(),
            report.teardown_errors.len()
        );
    }
    Ok(())
}
