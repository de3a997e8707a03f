//! Low-level process control: spawn detached children in their own process
//! group, probe them, and tear them down with an escalation ladder.

use std::{path::Path, process::Stdio, time::Duration};

use progd_process::SystemMemory;
use tokio::process::Command;

use crate::{
    error::{Result, SupervisorError},
    procfs,
    settings::RunnerSettings,
};

/// Output descriptors handed to a child at launch.
#[derive(Debug)]
pub struct LaunchStreams {
    pub stdout: std::fs::File,
    pub stderr: std::fs::File,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SignalTarget {
    Group(i32),
    Pid(i32),
}

impl SignalTarget {
    fn raw(self) -> i32 {
        match self {
            SignalTarget::Group(pgid) => -pgid,
            SignalTarget::Pid(pid) => pid,
        }
    }
}

/// Whitespace tokenization; no quoting rules.
pub(crate) fn tokenize(command: &str) -> Vec<&str> {
    command.split_whitespace().collect()
}

fn file_name(s: &str) -> &str {
    Path::new(s)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(s)
}

/// True if an observed argv token names the same executable.
pub(crate) fn executable_matches(observed: &str, expected: &str) -> bool {
    observed == expected || file_name(observed) == file_name(expected)
}

#[derive(Clone, Debug, Default)]
pub struct ProcessRunner {
    settings: RunnerSettings,
}

impl ProcessRunner {
    pub fn new(settings: RunnerSettings) -> Self {
        Self { settings }
    }

    /// Spawns `command` detached in a new process group and returns its pid
    /// once it has survived the grace period.
    pub async fn start(
        &self,
        command: &str,
        working_dir: &str,
        streams: LaunchStreams,
    ) -> Result<u32> {
        let argv = tokenize(command);
        let (&exec, args) = argv.split_first().ok_or(SupervisorError::EmptyCommand)?;

        let mut cmd = Command::new(exec);
        cmd.args(args);

        if !working_dir.is_empty() {
            let dir = Path::new(working_dir);
            let is_dir = tokio::fs::metadata(dir)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if !is_dir {
                return Err(SupervisorError::BadWorkingDir(dir.to_path_buf()));
            }
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(streams.stdout))
            .stderr(Stdio::from(streams.stderr))
            .kill_on_drop(false);

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // New session, so the child leads its own process group.
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SupervisorError::StartFailed(format!("spawn {exec}: {e}")))?;
        let pid = child.id().ok_or_else(|| {
            SupervisorError::StartFailed("child exited before its pid was observed".to_string())
        })?;

        tokio::time::sleep(self.settings.start_grace).await;

        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(SupervisorError::StartFailed(format!(
                    "exited during startup ({status})"
                )));
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(pid, %err, "try_wait failed after launch; falling back to probe");
            }
        }

        if !procfs::is_alive(pid).await {
            return Err(SupervisorError::StartFailed(format!(
                "pid {pid} not alive after {}ms",
                self.settings.start_grace.as_millis()
            )));
        }

        // Dropping the handle leaves the child running; the runtime reaps it
        // in the background once it exits.
        drop(child);
        tracing::info!(pid, exec, "child launched");
        Ok(pid)
    }

    /// Stops `pid` and its process group: SIGTERM, then SIGKILL, then
    /// SIGKILL to each direct child and one more SIGKILL round.
    pub async fn stop(&self, pid: u32) -> Result<()> {
        if pid == 0 || pid > i32::MAX as u32 || !procfs::is_alive(pid).await {
            return Ok(());
        }

        let target = signal_target(pid);
        tracing::info!(pid, ?target, "stopping process");

        send_signal(target, Signal::Term)?;
        if self.wait_for_exit(pid, self.settings.term_timeout).await {
            return Ok(());
        }

        tracing::warn!(pid, "process ignored SIGTERM; sending SIGKILL");
        send_signal(target, Signal::Kill)?;
        if self.wait_for_exit(pid, self.settings.kill_timeout).await {
            return Ok(());
        }

        for child in procfs::child_pids(pid).await {
            tracing::warn!(pid, child, "killing surviving child");
            if let Err(err) = send_signal(SignalTarget::Pid(child as i32), Signal::Kill) {
                tracing::warn!(pid, child, %err, "failed to kill child");
            }
        }
        send_signal(target, Signal::Kill)?;
        if self.wait_for_exit(pid, self.settings.kill_timeout).await {
            return Ok(());
        }

        Err(SupervisorError::StopTimeout(pid))
    }

    pub async fn is_alive(&self, pid: u32) -> bool {
        procfs::is_alive(pid).await
    }

    /// Guards against pid reuse: the live process must be running the
    /// program's executable. The second argv token is also accepted so that
    /// scripts started through a shebang interpreter still match.
    pub async fn verify(&self, pid: u32, command: &str) -> bool {
        let Some(&expected) = tokenize(command).first() else {
            return false;
        };
        match procfs::cmdline(pid).await {
            Some(argv) => argv
                .iter()
                .take(2)
                .any(|a| executable_matches(a, expected)),
            // Without a readable command line only liveness can be checked.
            None if cfg!(not(target_os = "linux")) => procfs::is_alive(pid).await,
            None => false,
        }
    }

    /// Resident set as (kB, MB); zero when the pid cannot be inspected.
    pub async fn memory(&self, pid: u32) -> (u64, f64) {
        if pid == 0 {
            return (0, 0.0);
        }
        match procfs::rss_kb(pid).await {
            Some(kb) => (kb, kb as f64 / 1024.0),
            None => (0, 0.0),
        }
    }

    pub async fn system_memory(&self) -> Result<SystemMemory> {
        procfs::system_memory()
            .await
            .ok_or_else(|| SupervisorError::ProbeFailed("system memory unavailable".to_string()))
    }

    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !procfs::is_alive(pid).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.settings.probe_interval).await;
        }
    }
}

/// Signals go to the group only when `pid` leads it; a non-leader shares
/// its group with processes we did not start.
fn signal_target(pid: u32) -> SignalTarget {
    match procfs::process_group(pid) {
        Some(pgid) if pgid as u32 == pid => SignalTarget::Group(pgid),
        _ => SignalTarget::Pid(pid as i32),
    }
}

#[derive(Clone, Copy, Debug)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal(target: SignalTarget, signal: Signal) -> Result<()> {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let rc = unsafe { libc::kill(target.raw(), sig) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Already gone.
        return Ok(());
    }
    tracing::warn!(?target, ?signal, %err, "signal delivery failed");
    if err.raw_os_error() == Some(libc::EPERM) {
        return Err(SupervisorError::ProbeFailed(format!(
            "not permitted to signal {}: {err}",
            target.raw()
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_signal(target: SignalTarget, _signal: Signal) -> Result<()> {
    Err(SupervisorError::ProbeFailed(format!(
        "signals are not supported on this platform (target {})",
        target.raw()
    )))
}
