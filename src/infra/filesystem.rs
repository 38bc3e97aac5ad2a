//! Filesystem operations
//!
//! Directory helpers plus the staging primitives used to materialize and
//! tear down sandbox roots.

use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};

use crate::error::FilesystemError;

/// Create a directory and all parent directories
pub fn create_dir_all(path: &Path) -> Result<(), FilesystemError> {
    std::fs::create_dir_all(path).map_err(|e| FilesystemError::CreateDir {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Remove a directory and all its contents
pub fn remove_dir_all(path: &Path) -> Result<(), FilesystemError> {
    if path.exists() {
        std::fs::remove_dir_all(path).map_err(|e| FilesystemError::RemoveDir {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
    }
    Ok(())
}

/// Specification of one bind mount inside a sandbox root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Host path to mount
    pub host_path: PathBuf,
    /// Path relative to the sandbox root
    pub sandbox_path: PathBuf,
    /// Whether the mount is read-only
    pub read_only: bool,
}

impl MountSpec {
    /// Create a new read-only mount spec
    pub fn read_only(host_path: PathBuf, sandbox_path: PathBuf) -> Self {
        Self {
            host_path,
            sandbox_path,
            read_only: true,
        }
    }

    /// Create a new read-write mount spec
    pub fn read_write(host_path: PathBuf, sandbox_path: PathBuf) -> Self {
        Self {
            host_path,
            sandbox_path,
            read_only: false,
        }
    }
}

/// Materialize a sandbox root: directory skeleton plus bind mounts
///
/// Returns the mount points that were applied, in mount order, so the
/// caller can tear them down in reverse. Bind-mounting requires
/// privileges; an empty spec list stages plain directories only.
pub fn materialize_root(root: &Path, specs: &[MountSpec]) -> Result<Vec<PathBuf>, FilesystemError> {
    create_dir_all(root)?;

    let mut mounted = Vec::with_capacity(specs.len());
    for spec in specs {
        let target = root.join(&spec.sandbox_path);
        create_dir_all(&target)?;
        bind_mount(&spec.host_path, &target, spec.read_only)?;
        mounted.push(target);
    }
    Ok(mounted)
}

/// Tear down a sandbox root: unmount in reverse mount order, remove the tree
///
/// A target that is no longer mounted is not an error; a target that
/// refuses to unmount is, since removing the tree underneath a live mount
/// would destroy the mount source's data.
pub fn teardown_root(root: &Path, mount_points: &[PathBuf]) -> Result<(), FilesystemError> {
    for target in mount_points.iter().rev() {
        unmount(target)?;
    }
    remove_dir_all(root)
}

/// Apply one bind mount, remounting read-only when requested
fn bind_mount(source: &Path, target: &Path, read_only: bool) -> Result<(), FilesystemError> {
    let mount_err = |e: nix::errno::Errno| FilesystemError::Mount {
        source: source.to_path_buf(),
        target: target.to_path_buf(),
        error: e.to_string(),
    };

    nix::mount::mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(mount_err)?;

    if read_only {
        // A bind mount ignores MS_RDONLY at creation; it takes a remount.
        nix::mount::mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(mount_err)?;
    }
    Ok(())
}

/// Unmount a target, tolerating targets that are not mounted
fn unmount(target: &Path) -> Result<(), FilesystemError> {
    match nix::mount::umount2(target, MntFlags::empty()) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EINVAL | nix::errno::Errno::ENOENT) => Ok(()),
        Err(e) => Err(FilesystemError::RemoveDir {
            path: target.to_path_buf(),
            error: format!("unmount failed: {e}"),
        }),
    }
}
