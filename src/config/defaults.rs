//! Default configuration values

use std::time::Duration;

/// Ceiling on worker slots regardless of detected CPU parallelism.
///
/// Each slot carries its own mount set; unbounded slot counts multiply
/// filesystem overhead faster than they buy build throughput.
pub const MAX_WORKER_SLOTS: usize = 16;

/// Default per-package build timeout (seconds)
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// Grace period between SIGTERM and SIGKILL for a build's process group
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Window after SIGKILL in which the process group must become empty
pub const REAP_CONFIRM_WINDOW: Duration = Duration::from_secs(5);

/// Poll interval while waiting for a process group to drain
pub const REAP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ledger database file name inside the state directory
pub const LEDGER_FILE: &str = "pkgbulk.redb";

/// Default state directory, relative to the recipe tree
pub const DEFAULT_STATE_DIR: &str = ".pkgbulk";

/// Default sandbox root directory, relative to the state directory
pub const DEFAULT_SANDBOX_DIR: &str = "sandboxes";

/// Build log directory, relative to the state directory
pub const LOG_DIR: &str = "logs";

/// Recipe file name inside each package directory
pub const RECIPE_FILE: &str = "recipe.toml";

/// Default number of worker slots: detected CPU parallelism, capped.
pub fn default_worker_slots() -> usize {
    num_cpus::get().clamp(1, MAX_WORKER_SLOTS)
}
