//! Sandbox slot management
//!
//! Each worker slot owns an isolated filesystem root with a fixed set of
//! bind mounts, materialized once at startup and reused across packages;
//! `prepare` only resets the mutable scratch area between builds. Isolation
//! is per-slot, not per-package.

use std::path::{Path, PathBuf};

use crate::core::package::PackageId;
use crate::error::SandboxError;
use crate::infra::filesystem::{self, MountSpec};
use crate::infra::mounts;

/// Writable build area inside a sandbox root
const WORK_DIR: &str = "work";

/// Writable temp area inside a sandbox root
const TMP_DIR: &str = "tmp";

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Directory under which all slot roots live
    pub root: PathBuf,
    /// Number of worker slots
    pub slots: usize,
    /// Fixed mount set applied to every slot (toolchain, package cache, ...)
    pub base_mounts: Vec<MountSpec>,
}

impl SandboxConfig {
    /// Create a config with no base mounts
    pub fn new(root: PathBuf, slots: usize) -> Self {
        Self {
            root,
            slots,
            base_mounts: Vec::new(),
        }
    }

    /// Add a base mount applied to every slot
    #[must_use]
    pub fn with_mount(mut self, spec: MountSpec) -> Self {
        self.base_mounts.push(spec);
        self
    }
}

/// An acquired worker-slot sandbox
///
/// Exclusively owned by one worker for the duration of one build; returns
/// to the manager's free pool afterwards.
#[derive(Debug)]
pub struct SandboxHandle {
    slot: usize,
    root: PathBuf,
    mount_points: Vec<PathBuf>,
}

impl SandboxHandle {
    /// Slot index
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Sandbox root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writable build directory for the current package
    pub fn work_dir(&self) -> PathBuf {
        self.root.join(WORK_DIR)
    }

    /// Writable temp directory for the current package
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    /// Reset scratch state for the next package
    ///
    /// The mount set stays in place; only `work/` and `tmp/` are wiped.
    pub fn prepare(&self, package: &PackageId) -> Result<(), SandboxError> {
        let prepare_err = |e: crate::error::FilesystemError| SandboxError::Prepare {
            slot: self.slot,
            package: package.to_string(),
            error: e.to_string(),
        };

        for dir in [self.work_dir(), self.tmp_dir()] {
            filesystem::remove_dir_all(&dir).map_err(prepare_err)?;
            filesystem::create_dir_all(&dir).map_err(prepare_err)?;
        }
        tracing::debug!(slot = self.slot, package = %package, "sandbox prepared");
        Ok(())
    }
}

/// Allocates and recycles worker-slot sandboxes
#[derive(Debug)]
pub struct SandboxManager {
    config: SandboxConfig,
    free: Vec<SandboxHandle>,
}

impl SandboxManager {
    /// Materialize all slot roots after a stale-mount health check
    ///
    /// Mounts already present under the sandbox area mean a prior run
    /// crashed without tearing down; reusing them risks cross-run data
    /// corruption, so startup fails and cleanup is left to an explicit
    /// operator action.
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        let stale = mounts::list_mounts_under(&config.root).map_err(|e| {
            SandboxError::Materialize {
                path: config.root.clone(),
                error: e.to_string(),
            }
        })?;
        if !stale.is_empty() {
            return Err(SandboxError::StaleMounts {
                root: config.root.clone(),
                mounts: stale
                    .iter()
                    .map(|m| m.mount_point.display().to_string())
                    .collect(),
            });
        }

        let mut free = Vec::with_capacity(config.slots);
        for slot in 0..config.slots {
            let root = config.root.join(format!("slot-{slot}"));
            let mount_points =
                filesystem::materialize_root(&root, &config.base_mounts).map_err(|e| {
                    SandboxError::Materialize {
                        path: root.clone(),
                        error: e.to_string(),
                    }
                })?;
            for dir in [root.join(WORK_DIR), root.join(TMP_DIR)] {
                filesystem::create_dir_all(&dir).map_err(|e| SandboxError::Materialize {
                    path: root.clone(),
                    error: e.to_string(),
                })?;
            }
            free.push(SandboxHandle {
                slot,
                root,
                mount_points,
            });
        }
        tracing::info!(slots = config.slots, root = %config.root.display(), "sandboxes ready");

        Ok(Self { config, free })
    }

    /// Number of configured slots
    pub fn slot_count(&self) -> usize {
        self.config.slots
    }

    /// Number of slots currently free
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Take a free sandbox, if any
    pub fn acquire(&mut self) -> Option<SandboxHandle> {
        self.free.pop()
    }

    /// Return a sandbox to the free pool
    pub fn release(&mut self, handle: SandboxHandle) {
        debug_assert!(handle.slot < self.config.slots);
        self.free.push(handle);
    }

    /// Tear down every slot root
    ///
    /// Callers must have released all handles first; tearing down while a
    /// build may still hold mounts open is the scheduler's reap invariant,
    /// not ours to re-check.
    pub fn shutdown(mut self) -> Result<(), SandboxError> {
        for handle in self.free.drain(..) {
            filesystem::teardown_root(&handle.root, &handle.mount_points).map_err(|e| {
                SandboxError::Teardown {
                    path: handle.root.clone(),
                    error: e.to_string(),
                }
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(slots: usize) -> (TempDir, SandboxManager) {
        let temp = TempDir::new().unwrap();
        let config = SandboxConfig::new(temp.path().join("sandboxes"), slots);
        let manager = SandboxManager::new(config).unwrap();
        (temp, manager)
    }

    #[test]
    fn test_materializes_slot_roots() {
        let (temp, manager) = manager(2);
        assert_eq!(manager.slot_count(), 2);
        assert!(temp.path().join("sandboxes/slot-0/work").is_dir());
        assert!(temp.path().join("sandboxes/slot-1/tmp").is_dir());
    }

    #[test]
    fn test_acquire_is_bounded_by_slot_count() {
        let (_temp, mut manager) = manager(2);

        let first = manager.acquire().unwrap();
        let second = manager.acquire().unwrap();
        assert!(manager.acquire().is_none());
        assert_eq!(manager.available(), 0);

        manager.release(first);
        assert!(manager.acquire().is_some());
        drop(second);
    }

    #[test]
    fn test_prepare_resets_scratch_only() {
        let (_temp, mut manager) = manager(1);
        let handle = manager.acquire().unwrap();

        let leftover = handle.work_dir().join("stale-artifact");
        std::fs::write(&leftover, "junk").unwrap();
        let keep = handle.root().join("not-scratch");
        std::fs::write(&keep, "kept").unwrap();

        handle.prepare(&"devel/libfoo".parse().unwrap()).unwrap();

        assert!(!leftover.exists());
        assert!(handle.work_dir().is_dir());
        assert!(keep.exists());
    }

    #[test]
    fn test_handles_are_distinct_roots() {
        let (_temp, mut manager) = manager(2);
        let a = manager.acquire().unwrap();
        let b = manager.acquire().unwrap();
        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn test_shutdown_removes_roots() {
        let (temp, manager) = manager(2);
        manager.shutdown().unwrap();
        assert!(!temp.path().join("sandboxes/slot-0").exists());
        assert!(!temp.path().join("sandboxes/slot-1").exists());
    }

    #[test]
    fn test_clean_root_passes_health_check() {
        let temp = TempDir::new().unwrap();
        let config = SandboxConfig::new(temp.path().join("fresh"), 1);
        assert!(SandboxManager::new(config).is_ok());
    }
}
