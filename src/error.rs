//! Error types for pkgbulk
//!
//! Domain-specific error types using thiserror.

use std::path::PathBuf;
use thiserror::Error;

/// Recipe loading errors
#[derive(Error, Debug)]
pub enum RecipeError {
    /// Recipe tree root not found
    #[error("Recipe directory not found: {path}")]
    RootNotFound { path: PathBuf },

    /// Failed to walk the recipe tree
    #[error("Failed to scan recipe tree at '{path}': {error}")]
    ScanFailed { path: PathBuf, error: String },

    /// Recipe file could not be parsed
    #[error("Failed to parse recipe '{path}': {error}")]
    ParseError { path: PathBuf, error: String },

    /// Package identity string is malformed
    #[error("Invalid package identity '{identity}': {reason}")]
    InvalidIdentity { identity: String, reason: String },

    /// Two recipes declare the same identity
    #[error("Duplicate recipe for '{identity}' (second definition at '{path}')")]
    DuplicateIdentity { identity: String, path: PathBuf },
}

/// Dependency graph construction errors
#[derive(Error, Debug)]
pub enum GraphError {
    /// Circular dependency detected
    #[error("Circular dependency detected: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    /// A recipe references a dependency that does not exist
    #[error("Missing dependency: '{dependency}' required by '{package}'")]
    MissingDependency { package: String, dependency: String },

    /// Status moved backward through the state machine
    #[error("Invalid status transition for '{package}': {from} -> {to}")]
    InvalidTransition {
        package: String,
        from: String,
        to: String,
    },

    /// Unknown package identity
    #[error("Unknown package: '{package}'")]
    UnknownPackage { package: String },
}

/// State ledger errors
///
/// Any of these is fatal to a run: continuing without durable state risks
/// silent duplicate or lost work.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Failed to open or create the database
    #[error("Failed to open ledger at '{path}': {error}")]
    Open { path: PathBuf, error: String },

    /// A read transaction failed
    #[error("Ledger read failed for '{key}': {error}")]
    Read { key: String, error: String },

    /// A write transaction failed
    #[error("Ledger write failed for '{key}': {error}")]
    Write { key: String, error: String },

    /// Entry could not be encoded or decoded
    #[error("Ledger entry for '{key}' is corrupt: {error}")]
    Codec { key: String, error: String },
}

/// Sandbox allocation and preparation errors
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Stale mounts from a prior run were found under the sandbox root
    #[error(
        "Stale mounts found under '{root}': {}. Run 'pkgbulk mounts --cleanup' to remove them",
        mounts.join(", ")
    )]
    StaleMounts { root: PathBuf, mounts: Vec<String> },

    /// Failed to materialize a sandbox root
    #[error("Failed to materialize sandbox root '{path}': {error}")]
    Materialize { path: PathBuf, error: String },

    /// Failed to reset scratch state between builds
    #[error("Failed to prepare sandbox slot {slot} for '{package}': {error}")]
    Prepare {
        slot: usize,
        package: String,
        error: String,
    },

    /// Failed to tear down a sandbox root
    #[error("Failed to tear down sandbox root '{path}': {error}")]
    Teardown { path: PathBuf, error: String },
}

/// Process runner errors
#[derive(Error, Debug)]
pub enum RunnerError {
    /// The build command could not be spawned
    #[error("Failed to spawn build command '{command}': {error}")]
    Spawn { command: String, error: String },

    /// Waiting on the child process failed
    #[error("Failed waiting for build process: {error}")]
    Wait { error: String },

    /// Captured output could not be written
    #[error("Failed to write build log '{path}': {error}")]
    LogWrite { path: PathBuf, error: String },

    /// The process group could not be emptied within the kill grace period
    #[error("Process group {pgid} could not be reaped; surviving pids: {pids:?}")]
    ReapFailure { pgid: i32, pids: Vec<i32> },
}

/// Mount inventory errors
#[derive(Error, Debug)]
pub enum MountError {
    /// The mount table could not be read
    #[error("Failed to read mount table: {error}")]
    ReadTable { error: String },

    /// An unmount operation failed
    #[error("Failed to unmount '{target}': {error}")]
    Unmount { target: PathBuf, error: String },
}

/// Filesystem errors
#[derive(Error, Debug)]
pub enum FilesystemError {
    /// Failed to create directory
    #[error("Failed to create directory '{path}': {error}")]
    CreateDir { path: PathBuf, error: String },

    /// Failed to remove directory
    #[error("Failed to remove directory '{path}': {error}")]
    RemoveDir { path: PathBuf, error: String },

    /// Failed to bind-mount
    #[error("Failed to mount '{source}' at '{target}': {error}")]
    Mount {
        source: PathBuf,
        target: PathBuf,
        error: String,
    },
}

/// Fatal scheduler errors
///
/// Package-level failures are recorded and cascaded, never raised through
/// this type; only infrastructure failures terminate the run.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Durable state could not be written
    #[error("Ledger failure: {0}")]
    Ledger(#[from] LedgerError),

    /// A build's process group survived the kill escalation
    #[error("Failed to reap build of '{package}': process group {pgid} left pids {pids:?}")]
    ReapFailure {
        package: String,
        pgid: i32,
        pids: Vec<i32>,
    },

    /// A worker task panicked or was aborted
    #[error("Worker for '{package}' terminated abnormally: {error}")]
    WorkerLost { package: String, error: String },
}

/// Top-level pkgbulk error type
#[derive(Error, Debug)]
pub enum PkgbulkError {
    /// Recipe error
    #[error("Recipe error: {0}")]
    Recipe(#[from] RecipeError),

    /// Graph error
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Sandbox error
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    /// Runner error
    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    /// Mount error
    #[error("Mount error: {0}")]
    Mount(#[from] MountError),

    /// Filesystem error
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] FilesystemError),

    /// Scheduler error
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// IO error
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}
