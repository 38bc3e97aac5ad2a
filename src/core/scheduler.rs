//! Build scheduling and dispatch
//!
//! The control loop that drives a run to completion or to a stable failed
//! state: pulls ready packages from the graph, dispatches them to worker
//! slots, consumes results over a channel, records outcomes in the ledger,
//! and cascades skips through the dependents of failed packages. Workers
//! never touch shared state; every mutation funnels through the single
//! result-handling path here.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::graph::Graph;
use crate::core::package::{
    now_unix_millis, BuildResult, BuildStatus, ExitDetail, PackageId,
};
use crate::core::report::RunReport;
use crate::error::{RunnerError, SchedulerError};
use crate::infra::ledger::{Ledger, LedgerEntry};
use crate::infra::runner::ProcessRunner;
use crate::infra::sandbox::{SandboxHandle, SandboxManager};

/// Callback invoked after each finished build, for progress reporting
pub type ProgressCallback = Box<dyn Fn(&BuildResult) + Send + Sync>;

/// One worker's report back to the control loop
struct WorkerMessage {
    id: PackageId,
    sandbox: SandboxHandle,
    outcome: Result<BuildResult, RunnerError>,
}

/// Ready-queue ordering: more transitive dependents first, ties broken by
/// earliest insertion order
#[derive(PartialEq, Eq)]
struct ReadyEntry {
    weight: usize,
    insertion: Reverse<usize>,
    id: PackageId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.weight
            .cmp(&other.weight)
            .then_with(|| self.insertion.cmp(&other.insertion))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Drives one bulk build run
pub struct Scheduler {
    graph: Graph,
    ledger: Ledger,
    sandboxes: SandboxManager,
    runner: ProcessRunner,
    build_timeout: Duration,
    cancel: CancellationToken,
    progress: Option<ProgressCallback>,
}

impl Scheduler {
    /// Assemble a scheduler over prepared collaborators
    pub fn new(
        graph: Graph,
        ledger: Ledger,
        sandboxes: SandboxManager,
        runner: ProcessRunner,
        build_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            graph,
            ledger,
            sandboxes,
            runner,
            build_timeout,
            cancel,
            progress: None,
        }
    }

    /// Register a per-result progress callback
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Run to completion or to a stable failed state
    ///
    /// Package-level failures are recorded and cascaded without stopping
    /// sibling branches; only infrastructure failures (ledger writes,
    /// unreapable process groups) abort the run.
    pub async fn run(mut self) -> Result<RunReport, SchedulerError> {
        let started = Instant::now();

        self.seed_resumed_state()?;
        self.settle_prefailed()?;

        let mut ready: BinaryHeap<ReadyEntry> = BinaryHeap::new();
        for id in self.graph.ready_frontier() {
            self.enqueue(&mut ready, id)?;
        }

        let slots = self.sandboxes.slot_count();
        let (tx, mut rx) = mpsc::channel::<WorkerMessage>(slots.max(1));
        let mut in_flight = 0usize;

        tracing::info!(
            packages = self.graph.remaining(),
            slots,
            run = self.ledger.run(),
            "starting build run"
        );

        loop {
            // Fill every free slot from the ready queue, unless aborted.
            while !self.cancel.is_cancelled() && self.sandboxes.available() > 0 {
                let Some(entry) = ready.pop() else { break };
                self.dispatch(entry.id, &tx)?;
                in_flight += 1;
            }

            if in_flight == 0 {
                break;
            }

            // One result at a time; builds keep running concurrently while
            // this loop is parked here.
            let Some(message) = rx.recv().await else { break };
            in_flight -= 1;
            self.sandboxes.release(message.sandbox);

            match message.outcome {
                Ok(result) => self.handle_result(&result, &mut ready)?,
                Err(RunnerError::ReapFailure { pgid, pids }) => {
                    // Living descendants would poison sandbox reuse for
                    // every later build; halt everything.
                    self.cancel.cancel();
                    drain_in_flight(&mut rx, &mut self.sandboxes, in_flight).await;
                    return Err(SchedulerError::ReapFailure {
                        package: message.id.to_string(),
                        pgid,
                        pids,
                    });
                }
                Err(error) => {
                    // Spawn and bookkeeping errors are confined to this
                    // package's attempt.
                    let result = BuildResult::sandbox_failed(message.id, error.to_string());
                    self.handle_result(&result, &mut ready)?;
                }
            }
        }

        if let Err(error) = self.sandboxes.shutdown() {
            tracing::warn!(%error, "sandbox teardown incomplete");
        }

        let aborted = self.cancel.is_cancelled();
        let report = RunReport::from_graph(
            &self.graph,
            self.ledger.run(),
            aborted,
            started.elapsed().as_millis() as u64,
        );
        tracing::info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            unbuilt = report.unbuilt.len(),
            aborted,
            "build run finished"
        );
        Ok(report)
    }

    /// Mark prior-run successes as pre-satisfied dependencies
    fn seed_resumed_state(&mut self) -> Result<(), SchedulerError> {
        for id in self.ledger.prior_successes()? {
            if self.graph.node(&id).is_some() {
                tracing::debug!(package = %id, "restored from ledger, skipping rebuild");
                self.graph.mark_presatisfied(&id).ok();
            }
        }
        Ok(())
    }

    /// Persist and cascade packages that were failed before scheduling
    /// (unparseable recipes)
    fn settle_prefailed(&mut self) -> Result<(), SchedulerError> {
        let prefailed: Vec<(PackageId, String)> = self
            .graph
            .nodes()
            .filter(|n| n.status == BuildStatus::Failed)
            .map(|n| {
                (
                    n.id.clone(),
                    n.detail.clone().unwrap_or_else(|| "failed".to_string()),
                )
            })
            .collect();

        for (id, detail) in prefailed {
            self.persist(&id, BuildStatus::Failed, Some(detail))?;
            self.cascade_skips(&id)?;
        }
        Ok(())
    }

    /// Move a ready package into the queued state and the ready queue
    fn enqueue(
        &mut self,
        ready: &mut BinaryHeap<ReadyEntry>,
        id: PackageId,
    ) -> Result<(), SchedulerError> {
        self.graph
            .mark_status(&id, BuildStatus::Queued)
            .map_err(invariant_broken)?;
        ready.push(ReadyEntry {
            weight: self.graph.dependent_weight(&id),
            insertion: Reverse(self.graph.insertion_index(&id)),
            id,
        });
        Ok(())
    }

    /// Hand one package to a worker task
    fn dispatch(
        &mut self,
        id: PackageId,
        tx: &mpsc::Sender<WorkerMessage>,
    ) -> Result<(), SchedulerError> {
        // Slot availability was checked by the caller; the pool cannot be
        // empty here.
        let Some(sandbox) = self.sandboxes.acquire() else {
            return Err(SchedulerError::WorkerLost {
                package: id.to_string(),
                error: "no sandbox available for dispatch".to_string(),
            });
        };

        self.graph
            .mark_status(&id, BuildStatus::Building)
            .map_err(invariant_broken)?;
        let command = self
            .graph
            .node(&id)
            .map(|n| n.command.clone())
            .unwrap_or_default();

        tracing::info!(package = %id, slot = sandbox.slot(), "dispatching build");

        let runner = self.runner.clone();
        let timeout = self.build_timeout;
        let cancel = self.cancel.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let outcome = match sandbox.prepare(&id) {
                Ok(()) => runner.run(&sandbox, &id, &command, timeout, &cancel).await,
                Err(e) => {
                    tracing::error!(package = %id, error = %e, "sandbox preparation failed");
                    Ok(BuildResult::sandbox_failed(id.clone(), e.to_string()))
                }
            };
            // The scheduler outlives every worker; a send failure means
            // the run is already being torn down.
            let _ = tx
                .send(WorkerMessage {
                    id,
                    sandbox,
                    outcome,
                })
                .await;
        });
        Ok(())
    }

    /// The single result-handling path: persist, cascade, unlock
    fn handle_result(
        &mut self,
        result: &BuildResult,
        ready: &mut BinaryHeap<ReadyEntry>,
    ) -> Result<(), SchedulerError> {
        tracing::info!(
            package = %result.id,
            status = %result.status,
            detail = %result.detail,
            duration_ms = result.duration.as_millis() as u64,
            "build finished"
        );

        match result.status {
            BuildStatus::Succeeded => {
                let unlocked = self
                    .graph
                    .mark_terminal(&result.id, BuildStatus::Succeeded, None)
                    .map_err(invariant_broken)?;
                // Durable before any dependent can be dispatched.
                self.persist(&result.id, BuildStatus::Succeeded, None)?;
                for id in unlocked {
                    self.enqueue(ready, id)?;
                }
            }
            _ => {
                let detail = result.detail.to_string();
                self.graph
                    .mark_terminal(&result.id, BuildStatus::Failed, Some(detail.clone()))
                    .map_err(invariant_broken)?;
                self.persist(&result.id, BuildStatus::Failed, Some(detail))?;
                // An aborted build says nothing about its dependents;
                // dependency failures do.
                if result.detail != ExitDetail::Cancelled {
                    self.cascade_skips(&result.id)?;
                }
            }
        }

        if let Some(progress) = &self.progress {
            progress(result);
        }
        Ok(())
    }

    /// Skip every transitive dependent of a failed package
    fn cascade_skips(&mut self, failed: &PackageId) -> Result<(), SchedulerError> {
        let dependents = self
            .graph
            .transitive_dependents(failed)
            .map_err(invariant_broken)?;
        for id in dependents {
            let Some(node) = self.graph.node(&id) else { continue };
            if node.status.is_terminal() || node.status == BuildStatus::Building {
                continue;
            }
            let reason = format!("dependency {failed} failed");
            self.graph
                .mark_terminal(&id, BuildStatus::Skipped, Some(reason.clone()))
                .map_err(invariant_broken)?;
            self.persist(&id, BuildStatus::Skipped, Some(reason))?;
            tracing::info!(package = %id, failed_dependency = %failed, "skipped");
        }
        Ok(())
    }

    /// Write one terminal entry to the ledger
    fn persist(
        &mut self,
        id: &PackageId,
        status: BuildStatus,
        detail: Option<String>,
    ) -> Result<(), SchedulerError> {
        self.ledger.put(
            id,
            &LedgerEntry {
                status,
                detail,
                run: self.ledger.run(),
                finished_at: now_unix_millis(),
            },
        )?;
        Ok(())
    }
}

/// Wait for remaining workers so no sandbox is torn down while a build may
/// still hold its mounts open
async fn drain_in_flight(
    rx: &mut mpsc::Receiver<WorkerMessage>,
    sandboxes: &mut SandboxManager,
    mut in_flight: usize,
) {
    while in_flight > 0 {
        let Some(message) = rx.recv().await else { break };
        sandboxes.release(message.sandbox);
        in_flight -= 1;
    }
}

/// Graph bookkeeping errors inside the loop mean the scheduler's own
/// invariants broke, not the user's recipes
fn invariant_broken(error: crate::error::GraphError) -> SchedulerError {
    SchedulerError::WorkerLost {
        package: "internal".to_string(),
        error: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(weight: usize, insertion: usize) -> ReadyEntry {
        ReadyEntry {
            weight,
            insertion: Reverse(insertion),
            id: PackageId::new("x", &format!("p{insertion}")),
        }
    }

    #[test]
    fn test_ready_order_prefers_heavier_packages() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(1, 0));
        heap.push(entry(5, 1));
        heap.push(entry(3, 2));

        assert_eq!(heap.pop().unwrap().weight, 5);
        assert_eq!(heap.pop().unwrap().weight, 3);
        assert_eq!(heap.pop().unwrap().weight, 1);
    }

    #[test]
    fn test_ready_order_ties_break_by_insertion() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(2, 7));
        heap.push(entry(2, 3));
        heap.push(entry(2, 5));

        assert_eq!(heap.pop().unwrap().insertion, Reverse(3));
        assert_eq!(heap.pop().unwrap().insertion, Reverse(5));
        assert_eq!(heap.pop().unwrap().insertion, Reverse(7));
    }
}
