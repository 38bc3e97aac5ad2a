//! CLI command implementations
//!
//! Each command is implemented in its own submodule.

pub mod build;
pub mod mounts;
pub mod status;

use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build every package in a recipe tree
    Build {
        /// Recipe tree root
        recipes_dir: PathBuf,

        /// Number of worker slots (default: CPU count, capped)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Per-package build timeout in seconds
        #[arg(long, env = "PKGBULK_TIMEOUT_SECS")]
        timeout_secs: Option<u64>,

        /// State directory (ledger, logs; default: <recipes-dir>/.pkgbulk)
        #[arg(long, env = "PKGBULK_STATE_DIR")]
        state_dir: Option<PathBuf>,

        /// Sandbox area root (default: <state-dir>/sandboxes)
        #[arg(long)]
        sandbox_root: Option<PathBuf>,

        /// Discard prior ledger state and rebuild everything
        #[arg(long)]
        fresh: bool,
    },

    /// Inspect a prior run's ledger
    Status {
        /// Recipe tree root the run was started from
        recipes_dir: PathBuf,

        /// State directory (default: <recipes-dir>/.pkgbulk)
        #[arg(long, env = "PKGBULK_STATE_DIR")]
        state_dir: Option<PathBuf>,
    },

    /// Report (and optionally clean up) stale sandbox mounts
    Mounts {
        /// Recipe tree root the run was started from
        recipes_dir: PathBuf,

        /// State directory (default: <recipes-dir>/.pkgbulk)
        #[arg(long, env = "PKGBULK_STATE_DIR")]
        state_dir: Option<PathBuf>,

        /// Unmount every stale mount that is found
        #[arg(long)]
        cleanup: bool,
    },
}

impl Commands {
    /// Execute the selected command
    pub async fn run(self, json: bool, quiet: bool) -> Result<()> {
        match self {
            Commands::Build {
                recipes_dir,
                jobs,
                timeout_secs,
                state_dir,
                sandbox_root,
                fresh,
            } => {
                build::execute(build::BuildOptions {
                    recipes_dir,
                    jobs,
                    timeout_secs,
                    state_dir,
                    sandbox_root,
                    fresh,
                    json,
                    quiet,
                })
                .await
            }
            Commands::Status {
                recipes_dir,
                state_dir,
            } => status::execute(&recipes_dir, state_dir.as_deref(), json),
            Commands::Mounts {
                recipes_dir,
                state_dir,
                cleanup,
            } => mounts::execute(&recipes_dir, state_dir.as_deref(), cleanup, json),
        }
    }
}

/// Resolve the state directory for a recipe tree
pub(crate) fn resolve_state_dir(
    recipes_dir: &std::path::Path,
    state_dir: Option<&std::path::Path>,
) -> PathBuf {
    state_dir.map_or_else(
        || recipes_dir.join(crate::config::defaults::DEFAULT_STATE_DIR),
        std::path::Path::to_path_buf,
    )
}
