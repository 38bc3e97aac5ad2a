//! Status command implementation
//!
//! Implements `pkgbulk status`: read-only inspection of a prior run's
//! ledger, without reconciling it against the current recipe set.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::cli::output::status;
use crate::config::defaults;
use crate::infra::ledger;

#[derive(Serialize)]
struct StatusReport<'a> {
    fingerprint: Option<&'a str>,
    run: u64,
    counts: BTreeMap<&'static str, usize>,
    packages: &'a BTreeMap<String, ledger::LedgerEntry>,
}

/// Execute the status command
pub fn execute(recipes_dir: &Path, state_dir: Option<&Path>, json: bool) -> Result<()> {
    let state_dir = super::resolve_state_dir(recipes_dir, state_dir);
    let ledger_path = state_dir.join(defaults::LEDGER_FILE);
    if !ledger_path.exists() {
        bail!(
            "No ledger found at {}. Run 'pkgbulk build' first.",
            ledger_path.display()
        );
    }

    let snapshot = ledger::inspect(&ledger_path)
        .with_context(|| format!("Failed to read ledger at {}", ledger_path.display()))?;

    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for entry in snapshot.entries.values() {
        *counts.entry(entry.status.as_str()).or_default() += 1;
    }

    if json {
        let report = StatusReport {
            fingerprint: snapshot.fingerprint.as_deref(),
            run: snapshot.run,
            counts,
            packages: &snapshot.entries,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Ledger: {}", ledger_path.display());
    println!("Last run: {}", snapshot.run);
    if let Some(fingerprint) = &snapshot.fingerprint {
        println!("Recipe-set fingerprint: {fingerprint}");
    }
    for (name, count) in &counts {
        println!("  {name}: {count}");
    }
    for (package, entry) in &snapshot.entries {
        let glyph = match entry.status {
            crate::core::package::BuildStatus::Succeeded => status::SUCCESS,
            crate::core::package::BuildStatus::Failed => status::ERROR,
            _ => status::WARNING,
        };
        match &entry.detail {
            Some(detail) => println!("  {glyph} {package} [run {}] {detail}", entry.run),
            None => println!("  {glyph} {package} [run {}]", entry.run),
        }
    }
    Ok(())
}
