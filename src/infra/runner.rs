//! Build command execution
//!
//! Runs one build command inside a sandbox as the sole direct child of a
//! dedicated process group, so everything the build transitively spawns
//! shares one reapable group. Enforces the wall-clock timeout and returns
//! only once the group is confirmed empty: a build that forks background
//! helpers must leave zero descendants behind, whether it exited on its
//! own, timed out, or was cancelled.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::defaults;
use crate::core::package::{BuildResult, BuildStatus, ExitDetail, PackageId};
use crate::error::RunnerError;
use crate::infra::sandbox::SandboxHandle;

/// Maximum captured line length; longer lines are truncated
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Executes build commands with full process-tree lifecycle control
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    /// Directory for per-package build logs
    log_dir: PathBuf,
    /// Grace period between SIGTERM and SIGKILL
    grace: Duration,
    /// Window after SIGKILL in which the group must become empty
    reap_window: Duration,
}

impl ProcessRunner {
    /// Create a runner writing logs under `log_dir`
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            grace: defaults::KILL_GRACE_PERIOD,
            reap_window: defaults::REAP_CONFIRM_WINDOW,
        }
    }

    /// Override the SIGTERM grace period
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run one build command to a terminal result
    ///
    /// The command runs via `/bin/sh -c` in the sandbox work directory
    /// with a minimal environment. Cancellation and timeout both
    /// terminate the whole process group; in every path the group is
    /// confirmed empty before this returns.
    pub async fn run(
        &self,
        sandbox: &SandboxHandle,
        id: &PackageId,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<BuildResult, RunnerError> {
        let started = Instant::now();
        let log_path = self.log_dir.join(log_file_name(id));

        tokio::fs::create_dir_all(&self.log_dir)
            .await
            .map_err(|e| RunnerError::LogWrite {
                path: log_path.clone(),
                error: e.to_string(),
            })?;
        let log_file = tokio::fs::File::create(&log_path)
            .await
            .map_err(|e| RunnerError::LogWrite {
                path: log_path.clone(),
                error: e.to_string(),
            })?;

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(sandbox.work_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Builds see only what the sandbox provides.
        cmd.env_clear();
        cmd.env("PATH", "/usr/bin:/bin:/usr/sbin:/sbin");
        cmd.env("HOME", sandbox.work_dir());
        cmd.env("TMPDIR", sandbox.tmp_dir());
        cmd.env("PKGBULK_PACKAGE", id.to_string());

        // One process group per build, so termination can target
        // everything the build spawns.
        let mut child: AsyncGroupChild = cmd.group_spawn().map_err(|e| RunnerError::Spawn {
            command: command.to_string(),
            error: e.to_string(),
        })?;
        let Some(pid) = child.inner().id() else {
            return Err(RunnerError::Wait {
                error: "child exited before its pid could be read".to_string(),
            });
        };
        let pgid = pid as i32;

        let (line_tx, line_rx) = mpsc::channel::<String>(64);
        let stdout_handle = child
            .inner()
            .stdout
            .take()
            .map(|out| tokio::spawn(read_lines(out, line_tx.clone())));
        let stderr_handle = child
            .inner()
            .stderr
            .take()
            .map(|err| tokio::spawn(read_lines(err, line_tx.clone())));
        drop(line_tx);
        let writer_handle = tokio::spawn(write_lines(log_file, line_rx, log_path.clone()));

        enum ExitReason {
            Completed(std::process::ExitStatus),
            Timeout,
            Cancelled,
        }

        let exit_reason = tokio::select! {
            wait_result = child.wait() => match wait_result {
                Ok(status) => ExitReason::Completed(status),
                Err(e) => {
                    return Err(RunnerError::Wait {
                        error: e.to_string(),
                    })
                }
            },
            () = tokio::time::sleep(timeout) => ExitReason::Timeout,
            () = cancel.cancelled() => ExitReason::Cancelled,
        };

        let detail = match exit_reason {
            ExitReason::Completed(status) => ExitDetail::Exited(status.code().unwrap_or(-1)),
            ExitReason::Timeout => {
                tracing::warn!(package = %id, timeout_secs = timeout.as_secs(), "build timed out");
                self.terminate_group(&mut child, pgid).await;
                ExitDetail::TimedOut
            }
            ExitReason::Cancelled => {
                tracing::info!(package = %id, "build cancelled");
                self.terminate_group(&mut child, pgid).await;
                ExitDetail::Cancelled
            }
        };

        // The direct child is gone; stragglers it left in the group are
        // not. Completion means "group confirmed empty", so drain it
        // before reporting anything.
        self.drain_group(pgid).await?;

        if let Some(handle) = stdout_handle {
            let _ = handle.await;
        }
        if let Some(handle) = stderr_handle {
            let _ = handle.await;
        }
        writer_handle.await.unwrap_or(Ok(()))?;

        let status = match detail {
            ExitDetail::Exited(0) => BuildStatus::Succeeded,
            _ => BuildStatus::Failed,
        };

        Ok(BuildResult {
            id: id.clone(),
            status,
            detail,
            duration: started.elapsed(),
            log_path: Some(log_path),
        })
    }

    /// SIGTERM the group, wait out the grace period, then SIGKILL
    async fn terminate_group(&self, child: &mut AsyncGroupChild, pgid: i32) {
        let group = Pid::from_raw(-pgid);

        if let Err(e) = signal::kill(group, Signal::SIGTERM) {
            if e != nix::errno::Errno::ESRCH {
                tracing::warn!(pgid, error = %e, "SIGTERM to process group failed");
            }
        }

        let deadline = tokio::time::Instant::now() + self.grace;
        while tokio::time::Instant::now() < deadline {
            if child.inner().try_wait().ok().flatten().is_some() {
                break;
            }
            tokio::time::sleep(defaults::REAP_POLL_INTERVAL).await;
        }

        if let Err(e) = signal::kill(group, Signal::SIGKILL) {
            if e != nix::errno::Errno::ESRCH {
                tracing::warn!(pgid, error = %e, "SIGKILL to process group failed");
            }
        }

        // Reap the direct child so it cannot linger as a zombie group
        // member.
        let _ = child.wait().await;
    }

    /// Escalate until the process group has no members left
    ///
    /// Cheap no-op for the common case of a well-behaved build. Survivors
    /// get SIGTERM, the grace period, SIGKILL, and the confirmation
    /// window; anything still alive after that is a `ReapFailure`, fatal
    /// to the run.
    async fn drain_group(&self, pgid: i32) -> Result<(), RunnerError> {
        if self.await_group_empty(pgid, Duration::ZERO).await {
            return Ok(());
        }

        let group = Pid::from_raw(-pgid);
        tracing::warn!(pgid, "build left surviving group members; escalating");

        let _ = signal::kill(group, Signal::SIGTERM);
        if self.await_group_empty(pgid, self.grace).await {
            return Ok(());
        }

        let _ = signal::kill(group, Signal::SIGKILL);
        if self.await_group_empty(pgid, self.reap_window).await {
            return Ok(());
        }

        Err(RunnerError::ReapFailure {
            pgid,
            pids: group_members(pgid),
        })
    }

    /// Poll until the group is empty or the window elapses
    async fn await_group_empty(&self, pgid: i32, window: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            if group_members(pgid).is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(defaults::REAP_POLL_INTERVAL).await;
        }
    }
}

/// Stream one output pipe into the log channel, line by line
async fn read_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if line.len() > MAX_LINE_LENGTH {
                    line.truncate(MAX_LINE_LENGTH);
                    line.push_str("... [truncated]\n");
                }
                if tx.send(line.clone()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "error reading build output");
                break;
            }
        }
    }
}

/// Drain the log channel into the per-package log file
async fn write_lines(
    mut file: tokio::fs::File,
    mut rx: mpsc::Receiver<String>,
    path: PathBuf,
) -> Result<(), RunnerError> {
    let log_err = |e: std::io::Error| RunnerError::LogWrite {
        path: path.clone(),
        error: e.to_string(),
    };
    while let Some(line) = rx.recv().await {
        file.write_all(line.as_bytes()).await.map_err(log_err)?;
    }
    file.flush().await.map_err(log_err)?;
    Ok(())
}

/// Live pids whose process group matches `pgid`
///
/// Scans `/proc`; pids that vanish mid-scan are fine, they are exactly
/// the ones we no longer care about.
fn group_members(pgid: i32) -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()))
        .filter(|&pid| {
            std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .ok()
                .and_then(|stat| parse_stat_pgrp(&stat))
                .is_some_and(|grp| grp == pgid)
        })
        .collect()
}

/// Extract the process-group field from `/proc/<pid>/stat`
///
/// The comm field may contain spaces and parentheses, so fields are
/// counted from after the last ')': state ppid pgrp ...
fn parse_stat_pgrp(stat: &str) -> Option<i32> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(2)?.parse().ok()
}

/// Log file name for a package: `devel/libfoo@fat` -> `devel_libfoo_fat.log`
fn log_file_name(id: &PackageId) -> String {
    format!("{}.log", id.to_string().replace(['/', '@'], "_"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::sandbox::{SandboxConfig, SandboxManager};
    use tempfile::TempDir;

    fn test_sandbox() -> (TempDir, SandboxHandle, ProcessRunner) {
        let temp = TempDir::new().unwrap();
        let config = SandboxConfig::new(temp.path().join("sandboxes"), 1);
        let mut manager = SandboxManager::new(config).unwrap();
        let handle = manager.acquire().unwrap();
        let runner = ProcessRunner::new(temp.path().join("logs"))
            .with_grace(Duration::from_millis(500));
        (temp, handle, runner)
    }

    fn pkg() -> PackageId {
        "devel/testpkg".parse().unwrap()
    }

    #[test]
    fn test_parse_stat_pgrp() {
        let stat = "1234 (sh) S 1 1234 1000 0 -1 4194304 0\n";
        assert_eq!(parse_stat_pgrp(stat), Some(1234));
    }

    #[test]
    fn test_parse_stat_pgrp_comm_with_spaces() {
        let stat = "42 (my (weird) name) R 1 777 1000 0 -1\n";
        assert_eq!(parse_stat_pgrp(stat), Some(777));
    }

    #[test]
    fn test_log_file_name() {
        assert_eq!(log_file_name(&pkg()), "devel_testpkg.log");
        let flavored: PackageId = "lang/python@minimal".parse().unwrap();
        assert_eq!(log_file_name(&flavored), "lang_python_minimal.log");
    }

    #[tokio::test]
    async fn test_successful_build() {
        let (_temp, sandbox, runner) = test_sandbox();
        let cancel = CancellationToken::new();

        let result = runner
            .run(&sandbox, &pkg(), "echo built ok", Duration::from_secs(10), &cancel)
            .await
            .unwrap();

        assert_eq!(result.status, BuildStatus::Succeeded);
        assert_eq!(result.detail, ExitDetail::Exited(0));
        let log = std::fs::read_to_string(result.log_path.unwrap()).unwrap();
        assert!(log.contains("built ok"));
    }

    #[tokio::test]
    async fn test_failed_build_preserves_exit_code() {
        let (_temp, sandbox, runner) = test_sandbox();
        let cancel = CancellationToken::new();

        let result = runner
            .run(&sandbox, &pkg(), "exit 3", Duration::from_secs(10), &cancel)
            .await
            .unwrap();

        assert_eq!(result.status, BuildStatus::Failed);
        assert_eq!(result.detail, ExitDetail::Exited(3));
    }

    #[tokio::test]
    async fn test_stderr_is_captured() {
        let (_temp, sandbox, runner) = test_sandbox();
        let cancel = CancellationToken::new();

        let result = runner
            .run(
                &sandbox,
                &pkg(),
                "echo to-stderr >&2; exit 1",
                Duration::from_secs(10),
                &cancel,
            )
            .await
            .unwrap();

        let log = std::fs::read_to_string(result.log_path.unwrap()).unwrap();
        assert!(log.contains("to-stderr"));
    }

    #[tokio::test]
    async fn test_build_runs_in_sandbox_workdir() {
        let (_temp, sandbox, runner) = test_sandbox();
        let cancel = CancellationToken::new();

        runner
            .run(&sandbox, &pkg(), "touch artifact", Duration::from_secs(10), &cancel)
            .await
            .unwrap();

        assert!(sandbox.work_dir().join("artifact").exists());
    }

    #[tokio::test]
    async fn test_timeout_kills_whole_group() {
        let (_temp, sandbox, runner) = test_sandbox();
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let result = runner
            .run(
                &sandbox,
                &pkg(),
                // Two background helpers plus the parent, all long-lived.
                "sleep 300 & sleep 300 & sleep 300",
                Duration::from_millis(200),
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(result.status, BuildStatus::Failed);
        assert_eq!(result.detail, ExitDetail::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_background_children_reaped_after_normal_exit() {
        let (_temp, sandbox, runner) = test_sandbox();
        let cancel = CancellationToken::new();

        // The parent exits zero immediately but leaves a daemon behind.
        let result = runner
            .run(
                &sandbox,
                &pkg(),
                "sleep 300 & exit 0",
                Duration::from_secs(10),
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(result.status, BuildStatus::Succeeded);
        // run() only returns once the group is empty; nothing from the
        // build survives it.
    }

    #[tokio::test]
    async fn test_cancellation_stops_build() {
        let (_temp, sandbox, runner) = test_sandbox();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = runner
            .run(&sandbox, &pkg(), "sleep 300", Duration::from_secs(600), &cancel)
            .await
            .unwrap();

        assert_eq!(result.status, BuildStatus::Failed);
        assert_eq!(result.detail, ExitDetail::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_spawn_failure_when_workdir_missing() {
        let (_temp, sandbox, runner) = test_sandbox();
        let cancel = CancellationToken::new();
        std::fs::remove_dir_all(sandbox.work_dir()).unwrap();

        let result = runner
            .run(&sandbox, &pkg(), "true", Duration::from_secs(10), &cancel)
            .await;

        assert!(matches!(result, Err(RunnerError::Spawn { .. })));
    }
}
