/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Thin wrapper around the analysis server OS process.
//!
//! Validates the executable before launch, captures stdio, drains stderr
//! into the log, watches for exit on a monitor task, and implements the
//! graceful-signal-then-kill stop ladder.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Notification that the child exited, delivered to the controller.
#[derive(Debug, Clone, Copy)]
pub struct ExitNotice {
    /// OS exit code, if one was reported.
    pub code: Option<i32>,
}

struct StopRequest {
    graceful: bool,
    done: oneshot::Sender<()>,
}

/// A launched analysis server with its captured streams.
pub struct SpawnedServer {
    /// The child's stdin, for the framed channel's write side.
    pub stdin: ChildStdin,
    /// The child's stdout, for the framed channel's read side.
    pub stdout: ChildStdout,
    /// Control handle for stopping the process.
    pub handle: ProcessHandle,
}

/// Control handle over a spawned process.
pub struct ProcessHandle {
    pid: Option<u32>,
    control: mpsc::Sender<StopRequest>,
    grace: Duration,
}

impl ProcessHandle {
    /// OS process id, while the process is identifiable.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Stop the process: graceful signal first when asked, bounded wait,
    /// forced kill if it is still alive. Resolves once the process is gone.
    pub async fn stop(&self, graceful: bool) {
        let (done, done_rx) = oneshot::channel();
        if self
            .control
            .send(StopRequest { graceful, done })
            .await
            .is_err()
        {
            // Monitor already exited: the process is gone.
            return;
        }
        // Bounded by grace + kill inside the monitor; the extra margin covers
        // scheduling.
        let deadline = self.grace + Duration::from_secs(5);
        if tokio::time::timeout(deadline, done_rx).await.is_err() {
            warn!("timed out waiting for process monitor to confirm stop");
        }
    }
}

/// Validate that `command` resolves to a runnable executable and that the
/// working directory exists.
///
/// # Errors
///
/// Returns [`Error::Startup`] naming whichever precondition failed.
pub fn validate(command: &str, working_dir: Option<&Path>) -> Result<PathBuf> {
    if command.is_empty() {
        return Err(Error::Startup("no server command configured".to_string()));
    }
    let executable = which::which(command)
        .map_err(|e| Error::Startup(format!("executable '{command}' not found: {e}")))?;
    if let Some(dir) = working_dir
        && !dir.is_dir()
    {
        return Err(Error::Startup(format!(
            "working directory '{}' does not exist",
            dir.display()
        )));
    }
    Ok(executable)
}

/// Launch the server process and start its exit monitor.
///
/// The monitor task owns the [`Child`]; it reports the eventual exit through
/// `exit_tx` exactly once and services stop requests from the returned
/// handle.
///
/// # Errors
///
/// Returns [`Error::Startup`] when the process cannot be spawned or its
/// streams cannot be captured.
pub fn spawn(
    executable: &Path,
    args: &[String],
    working_dir: Option<&Path>,
    grace: Duration,
    exit_tx: mpsc::Sender<ExitNotice>,
) -> Result<SpawnedServer> {
    let mut command = Command::new(executable);
    command
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }

    let mut child = command
        .spawn()
        .map_err(|e| Error::Startup(format!("failed to spawn '{}': {e}", executable.display())))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Startup("child stdin not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Startup("child stdout not captured".to_string()))?;
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_stderr(stderr));
    }

    let pid = child.id();
    let (control_tx, control_rx) = mpsc::channel(4);
    tokio::spawn(monitor(child, control_rx, exit_tx, grace));

    Ok(SpawnedServer {
        stdin,
        stdout,
        handle: ProcessHandle {
            pid,
            control: control_tx,
            grace,
        },
    })
}

/// Mirror the child's stderr into the log, line by line.
async fn drain_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "tether::server_stderr", "{line}");
    }
}

/// Own the child until it exits, by itself or by request.
async fn monitor(
    mut child: Child,
    mut control: mpsc::Receiver<StopRequest>,
    exit_tx: mpsc::Sender<ExitNotice>,
    grace: Duration,
) {
    tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            debug!("analysis server exited with code {code:?}");
            let _ = exit_tx.send(ExitNotice { code }).await;
        }
        Some(request) = control.recv() => {
            let code = stop_child(&mut child, request.graceful, grace).await;
            let _ = exit_tx.send(ExitNotice { code }).await;
            let _ = request.done.send(());
        }
    }
}

/// Termination ladder: signal, bounded wait, kill.
async fn stop_child(child: &mut Child, graceful: bool, grace: Duration) -> Option<i32> {
    if graceful && let Some(pid) = child.id() {
        send_term_signal(pid).await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => return status.ok().and_then(|s| s.code()),
            Err(_) => warn!("analysis server ignored termination signal for {grace:?}"),
        }
    }

    if let Err(e) = child.kill().await {
        warn!("failed to kill analysis server: {e}");
    }
    child.wait().await.ok().and_then(|s| s.code())
}

/// Ask the process to terminate politely.
#[cfg(unix)]
async fn send_term_signal(pid: u32) {
    // `kill` keeps us out of unsafe libc territory.
    let result = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        warn!("failed to send SIGTERM to {pid}: {e}");
    }
}

#[cfg(not(unix))]
async fn send_term_signal(_pid: u32) {
    // No portable polite signal; the caller falls through to kill().
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};

    #[test]
    fn test_validate_rejects_empty_command() {
        assert!(matches!(validate("", None), Err(Error::Startup(_))));
    }

    #[test]
    fn test_validate_rejects_unknown_executable() {
        let err = validate("definitely-not-a-real-binary-4c1b", None);
        assert!(matches!(err, Err(Error::Startup(_))));
    }

    #[test]
    fn test_validate_rejects_missing_working_dir() -> Result<()> {
        // `sh` exists everywhere we run tests.
        let exe = validate("sh", None)?;
        assert!(exe.is_absolute());

        let missing = Path::new("/definitely/not/a/dir/4c1b");
        let err = validate("sh", Some(missing));
        assert!(matches!(err, Err(Error::Startup(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_spawn_reports_exit_code() -> Result<()> {
        let exe = validate("sh", None)?;
        let (exit_tx, mut exit_rx) = mpsc::channel(1);
        let spawned = spawn(
            &exe,
            &["-c".to_string(), "exit 3".to_string()],
            None,
            Duration::from_millis(200),
            exit_tx,
        )?;
        drop(spawned.stdin);

        let notice = tokio::time::timeout(Duration::from_secs(5), exit_rx.recv())
            .await?
            .context("monitor dropped without notice")?;
        assert_eq!(notice.code, Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_kills_stubborn_process() -> Result<()> {
        let exe = validate("sh", None)?;
        let (exit_tx, mut exit_rx) = mpsc::channel(1);
        // Ignores TERM, blocks on stdin forever.
        let spawned = spawn(
            &exe,
            &["-c".to_string(), "trap '' TERM; read x".to_string()],
            None,
            Duration::from_millis(100),
            exit_tx,
        )?;

        spawned.handle.stop(true).await;

        let notice = tokio::time::timeout(Duration::from_secs(5), exit_rx.recv())
            .await?
            .context("monitor dropped without notice")?;
        // Killed, so no clean exit code.
        assert!(notice.code.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_after_exit_is_noop() -> Result<()> {
        let exe = validate("sh", None)?;
        let (exit_tx, mut exit_rx) = mpsc::channel(1);
        let spawned = spawn(
            &exe,
            &["-c".to_string(), "exit 0".to_string()],
            None,
            Duration::from_millis(100),
            exit_tx,
        )?;

        let _ = tokio::time::timeout(Duration::from_secs(5), exit_rx.recv()).await?;
        // Monitor has exited; stop must return promptly instead of hanging.
        spawned.handle.stop(true).await;
        Ok(())
    }
}
