//! Mounts command implementation
//!
//! Implements `pkgbulk mounts`: report mounts left under the sandbox area
//! by a crashed run, and unmount them when `--cleanup` is given. Cleanup
//! is never automatic; a stale mount means a run died unexpectedly and
//! the operator should know before state is destroyed.

use std::path::Path;

use anyhow::{bail, Result};

use crate::cli::output::status;
use crate::config::defaults;
use crate::infra::mounts;

/// Execute the mounts command
pub fn execute(
    recipes_dir: &Path,
    state_dir: Option<&Path>,
    cleanup: bool,
    json: bool,
) -> Result<()> {
    let state_dir = super::resolve_state_dir(recipes_dir, state_dir);
    let sandbox_root = state_dir.join(defaults::DEFAULT_SANDBOX_DIR);

    let entries = mounts::list_mounts_under(&sandbox_root)?;

    if json {
        let listed: Vec<_> = entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "source": e.source,
                    "mount_point": e.mount_point,
                    "fstype": e.fstype,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listed)?);
    } else if entries.is_empty() {
        println!(
            "{} No stale mounts under {}",
            status::SUCCESS,
            sandbox_root.display()
        );
    } else {
        println!(
            "{} {} stale mounts under {}:",
            status::WARNING,
            entries.len(),
            sandbox_root.display()
        );
        for entry in &entries {
            println!(
                "  {} -> {} ({})",
                entry.source,
                entry.mount_point.display(),
                entry.fstype
            );
        }
    }

    if entries.is_empty() {
        return Ok(());
    }

    if cleanup {
        let removed = mounts::cleanup_mounts(&sandbox_root)?;
        if !json {
            println!("{} Unmounted {} stale mounts", status::SUCCESS, removed.len());
        }
        Ok(())
    } else {
        bail!(
            "{} stale mounts found. Re-run with --cleanup to unmount them",
            entries.len()
        );
    }
}
