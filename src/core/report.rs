//! Final run report
//!
//! Aggregates per-package outcomes for operator-facing output. The run as
//! a whole is successful only if nothing failed, was skipped, or was left
//! unbuilt by an abort.

use serde::Serialize;

use crate::core::graph::Graph;
use crate::core::package::BuildStatus;

/// One reported package with its reason
#[derive(Debug, Clone, Serialize)]
pub struct ReportLine {
    /// Package identity
    pub package: String,
    /// Failure or skip reason
    pub reason: String,
}

/// Summary of one scheduler run
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// Run identifier from the ledger
    pub run: u64,
    /// Whether the run was aborted by the operator
    pub aborted: bool,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Packages that built successfully (or were restored from the ledger)
    pub succeeded: Vec<String>,
    /// Packages whose build failed, with reasons
    pub failed: Vec<ReportLine>,
    /// Packages skipped because a dependency failed, with reasons
    pub skipped: Vec<ReportLine>,
    /// Packages never reaching a terminal status (aborted runs only)
    pub unbuilt: Vec<String>,
}

impl RunReport {
    /// Collect the report from the graph's final state
    pub fn from_graph(graph: &Graph, run: u64, aborted: bool, duration_ms: u64) -> Self {
        let mut report = Self {
            run,
            aborted,
            duration_ms,
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            unbuilt: Vec::new(),
        };

        for node in graph.nodes() {
            let package = node.id.to_string();
            let reason = || node.detail.clone().unwrap_or_else(|| "unknown".to_string());
            match node.status {
                BuildStatus::Succeeded => report.succeeded.push(package),
                BuildStatus::Failed => report.failed.push(ReportLine {
                    package,
                    reason: reason(),
                }),
                BuildStatus::Skipped => report.skipped.push(ReportLine {
                    package,
                    reason: reason(),
                }),
                BuildStatus::Pending | BuildStatus::Queued | BuildStatus::Building => {
                    report.unbuilt.push(package);
                }
            }
        }
        report
    }

    /// Whether every package reached `Succeeded`
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty() && self.unbuilt.is_empty()
    }

    /// Total number of packages covered by the report
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len() + self.unbuilt.len()
    }
}
