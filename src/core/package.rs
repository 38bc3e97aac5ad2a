//! Package identity, status, and build results
//!
//! A package is one buildable unit. Identity is category + short name plus
//! an optional flavor suffix; a flavor change is an identity change.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RecipeError;

/// Unique package identity: `category/name` or `category/name@flavor`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageId {
    /// Namespace (e.g. "devel", "lang")
    pub category: String,
    /// Short package name
    pub name: String,
    /// Optional build variant; changes the identity
    pub flavor: Option<String>,
}

impl PackageId {
    /// Create an identity without a flavor
    pub fn new(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            flavor: None,
        }
    }

    /// Create an identity with a flavor
    pub fn with_flavor(category: &str, name: &str, flavor: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            flavor: Some(flavor.to_string()),
        }
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.flavor {
            Some(flavor) => write!(f, "{}/{}@{}", self.category, self.name, flavor),
            None => write!(f, "{}/{}", self.category, self.name),
        }
    }
}

impl FromStr for PackageId {
    type Err = RecipeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| RecipeError::InvalidIdentity {
            identity: s.to_string(),
            reason: reason.to_string(),
        };

        let (path, flavor) = match s.split_once('@') {
            Some((_, flavor)) if flavor.is_empty() => {
                return Err(invalid("empty flavor after '@'"))
            }
            Some((path, flavor)) => (path, Some(flavor)),
            None => (s, None),
        };

        let (category, name) = path
            .split_once('/')
            .ok_or_else(|| invalid("expected 'category/name'"))?;

        if category.is_empty() || name.is_empty() {
            return Err(invalid("empty category or name"));
        }
        if name.contains('/') {
            return Err(invalid("more than one '/'"));
        }

        Ok(match flavor {
            Some(flavor) => Self::with_flavor(category, name, flavor),
            None => Self::new(category, name),
        })
    }
}

/// Build status of a package
///
/// Transitions only move forward: pending -> queued -> building ->
/// {succeeded, failed, skipped}. `Skipped` is reachable only from
/// `Pending`/`Queued` via a failed dependency, never from `Building`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    /// Waiting on unmet dependencies
    Pending,
    /// All dependencies satisfied, waiting for a worker slot
    Queued,
    /// Dispatched to a worker
    Building,
    /// Build completed with exit code zero
    Succeeded,
    /// Build failed, timed out, or could not be sandboxed
    Failed,
    /// Not attempted because a transitive dependency failed
    Skipped,
}

impl BuildStatus {
    /// Whether this status ends the package's lifecycle for the run
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Queued)
                | (Self::Pending | Self::Queued, Self::Skipped | Self::Failed)
                | (Self::Queued, Self::Building)
                | (Self::Building, Self::Succeeded | Self::Failed)
        )
    }

    /// Stable lowercase name, matching the serialized form
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Building => "building",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node in the dependency graph
#[derive(Debug, Clone)]
pub struct PackageNode {
    /// Package identity
    pub id: PackageId,
    /// Build-time dependencies, in declaration order
    pub build_depends: Vec<PackageId>,
    /// Run-time dependencies, in declaration order
    pub run_depends: Vec<PackageId>,
    /// Build command line, run via the shell inside a sandbox
    pub command: String,
    /// Current status
    pub status: BuildStatus,
    /// Error detail for failed/skipped packages
    pub detail: Option<String>,
    /// Unix millis when the build was dispatched
    pub started_at: Option<u64>,
    /// Unix millis when the terminal status was recorded
    pub finished_at: Option<u64>,
}

/// How a finished build exited
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitDetail {
    /// Process group exited on its own with this code
    Exited(i32),
    /// Killed after exceeding the wall-clock timeout
    TimedOut,
    /// Killed by operator abort
    Cancelled,
    /// The sandbox could not be prepared for this attempt
    SandboxFailed(String),
}

impl fmt::Display for ExitDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::SandboxFailed(msg) => write!(f, "sandbox failure: {msg}"),
        }
    }
}

/// Immutable record of one finished build attempt
///
/// Produced exactly once per package per run by a worker; consumed by the
/// scheduler to update the ledger and unlock dependents.
#[derive(Debug, Clone)]
pub struct BuildResult {
    /// Package identity
    pub id: PackageId,
    /// Terminal status: `Succeeded` or `Failed`
    pub status: BuildStatus,
    /// Exit detail
    pub detail: ExitDetail,
    /// Wall-clock duration of the attempt
    pub duration: Duration,
    /// Captured combined output, if the build got far enough to produce any
    pub log_path: Option<PathBuf>,
}

impl BuildResult {
    /// Result for a build whose sandbox could not be prepared
    pub fn sandbox_failed(id: PackageId, error: String) -> Self {
        Self {
            id,
            status: BuildStatus::Failed,
            detail: ExitDetail::SandboxFailed(error),
            duration: Duration::ZERO,
            log_path: None,
        }
    }
}

/// Current wall-clock time as unix milliseconds
pub fn now_unix_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
