//! Build command implementation
//!
//! Implements `pkgbulk build`: load recipes, validate the graph, open the
//! ledger, stand up the sandbox pool, and hand everything to the scheduler.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;

use crate::cli::output::{self, status};
use crate::config::defaults;
use crate::core::graph::Graph;
use crate::core::recipe;
use crate::core::report::RunReport;
use crate::core::scheduler::Scheduler;
use crate::infra::ledger::Ledger;
use crate::infra::runner::ProcessRunner;
use crate::infra::sandbox::{SandboxConfig, SandboxManager};

/// Build options
pub struct BuildOptions {
    /// Recipe tree root
    pub recipes_dir: PathBuf,
    /// Number of worker slots
    pub jobs: Option<usize>,
    /// Per-package timeout in seconds
    pub timeout_secs: Option<u64>,
    /// State directory override
    pub state_dir: Option<PathBuf>,
    /// Sandbox area override
    pub sandbox_root: Option<PathBuf>,
    /// Discard prior ledger state
    pub fresh: bool,
    /// Emit the report as JSON
    pub json: bool,
    /// Suppress progress output
    pub quiet: bool,
}

/// Execute the build command
pub async fn execute(options: BuildOptions) -> Result<()> {
    let recipe_set = recipe::load_recipes(&options.recipes_dir)
        .with_context(|| format!("Failed to load recipes from {}", options.recipes_dir.display()))?;
    if recipe_set.is_empty() {
        bail!(
            "No recipes found under {}. Expected <category>/<name>/{}",
            options.recipes_dir.display(),
            defaults::RECIPE_FILE
        );
    }
    tracing::info!(
        recipes = recipe_set.records.len(),
        broken = recipe_set.broken.len(),
        "recipes loaded"
    );

    // Cycles and unresolved references abort before any build starts.
    let graph = Graph::build(&recipe_set).context("Recipe set failed validation")?;

    let state_dir = super::resolve_state_dir(&options.recipes_dir, options.state_dir.as_deref());
    let ledger_path = state_dir.join(defaults::LEDGER_FILE);
    if options.fresh && ledger_path.exists() {
        std::fs::remove_file(&ledger_path)
            .with_context(|| format!("Failed to remove ledger at {}", ledger_path.display()))?;
        tracing::info!("prior ledger discarded (--fresh)");
    }
    let ledger = Ledger::open(&ledger_path, &recipe_set.fingerprint())?;

    let slots = options.jobs.unwrap_or_else(defaults::default_worker_slots).max(1);
    let sandbox_root = options
        .sandbox_root
        .unwrap_or_else(|| state_dir.join(defaults::DEFAULT_SANDBOX_DIR));
    let sandboxes = SandboxManager::new(SandboxConfig::new(sandbox_root, slots))?;

    let runner = ProcessRunner::new(state_dir.join(defaults::LOG_DIR));
    let timeout = Duration::from_secs(options.timeout_secs.unwrap_or(defaults::DEFAULT_TIMEOUT_SECS));

    // Operator abort: stop dispatching at once, then kill and reap every
    // in-flight group before exiting.
    let cancel = CancellationToken::new();
    let abort = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("abort requested; terminating in-flight builds");
            abort.cancel();
        }
    });

    let mut scheduler = Scheduler::new(graph, ledger, sandboxes, runner, timeout, cancel);
    if !options.quiet && !options.json {
        let bar = output::create_build_bar(recipe_set.len() as u64);
        scheduler = scheduler.with_progress(Box::new(move |result| {
            bar.inc(1);
            bar.set_message(format!("{} {}", result.id, result.status));
        }));
    }

    let report = scheduler.run().await?;
    if options.json || !options.quiet {
        display_report(&report, options.json)?;
    }

    if report.aborted {
        bail!("Build aborted with {} packages unbuilt", report.unbuilt.len());
    }
    if !report.is_success() {
        bail!(
            "Build finished with {} failed, {} skipped",
            report.failed.len(),
            report.skipped.len()
        );
    }
    Ok(())
}

/// Print the final report
fn display_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!(
        "Run {} finished in {:.1}s: {} succeeded, {} failed, {} skipped",
        report.run,
        report.duration_ms as f64 / 1000.0,
        report.succeeded.len(),
        report.failed.len(),
        report.skipped.len()
    );
    for line in &report.failed {
        println!("  {} {} ({})", status::ERROR, line.package, line.reason);
    }
    for line in &report.skipped {
        println!("  {} {} ({})", status::WARNING, line.package, line.reason);
    }
    if !report.unbuilt.is_empty() {
        println!("  {} {} packages not built (aborted)", status::INFO, report.unbuilt.len());
    }
    if report.is_success() {
        println!("{} All {} packages built", status::SUCCESS, report.succeeded.len());
    }
    Ok(())
}
