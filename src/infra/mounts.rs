//! Mount inventory
//!
//! Enumerates active mounts under a root prefix. Used by the sandbox
//! manager's startup health check (a mount left under the sandbox area by
//! a crashed run must fail the run, never be silently reused) and by the
//! `pkgbulk mounts` diagnostic command.

use std::path::{Path, PathBuf};

use crate::error::MountError;

/// Kernel mount table
const MOUNT_TABLE: &str = "/proc/self/mounts";

/// One active mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mount source (device, bind source, or pseudo-fs name)
    pub source: String,
    /// Mount point
    pub mount_point: PathBuf,
    /// Filesystem type
    pub fstype: String,
}

/// List active mounts whose mount point lies under `prefix`
pub fn list_mounts_under(prefix: &Path) -> Result<Vec<MountEntry>, MountError> {
    let content = std::fs::read_to_string(MOUNT_TABLE).map_err(|e| MountError::ReadTable {
        error: e.to_string(),
    })?;
    Ok(parse_mount_table(&content, prefix))
}

/// Unmount every mount under `prefix`, deepest mount point first
///
/// Explicit operator action (`pkgbulk mounts --cleanup`); never called on
/// the happy path. Returns the mount points that were removed.
pub fn cleanup_mounts(prefix: &Path) -> Result<Vec<PathBuf>, MountError> {
    let mut entries = list_mounts_under(prefix)?;
    // Deepest first so nested mounts release before their parents.
    entries.sort_by_key(|e| std::cmp::Reverse(e.mount_point.components().count()));

    let mut removed = Vec::with_capacity(entries.len());
    for entry in entries {
        nix::mount::umount2(&entry.mount_point, nix::mount::MntFlags::empty()).map_err(|e| {
            MountError::Unmount {
                target: entry.mount_point.clone(),
                error: e.to_string(),
            }
        })?;
        tracing::info!(mount_point = %entry.mount_point.display(), "unmounted stale mount");
        removed.push(entry.mount_point);
    }
    Ok(removed)
}

/// Parse mount-table content, keeping entries under `prefix`
fn parse_mount_table(content: &str, prefix: &Path) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let mount_point = PathBuf::from(unescape_mount_field(fields.next()?));
            let fstype = fields.next()?;
            mount_point.starts_with(prefix).then(|| MountEntry {
                source: unescape_mount_field(source),
                mount_point,
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

/// Decode the octal escapes the kernel uses for whitespace in mount paths
fn unescape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.clone().take(3).collect();
        if digits.len() == 3 && digits.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
            if let Ok(byte) = u8::from_str_radix(&digits, 8) {
                out.push(byte as char);
                for _ in 0..3 {
                    chars.next();
                }
                continue;
            }
        }
        out.push(c);
    }
    out
}
