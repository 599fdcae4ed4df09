//! Child processes for completion backends and pool jobs.
//!
//! Every child runs in its own process group so that a timeout, a dropped
//! caller or a forwarded signal reaches the whole tree it spawned.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Time between SIGTERM and SIGKILL when a child overruns its deadline.
const KILL_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Deadline for the child; `None` leaves enforcement to the caller.
    pub timeout: Option<Duration>,
    /// Tag put in front of every relayed output line.
    pub log_prefix: String,
    pub env: Vec<(String, String)>,
    /// Written to the child's stdin, which is then closed.
    pub stdin_data: Option<String>,
}

#[derive(Debug)]
pub struct ProcessOutput {
    /// Exit code, or `128 + signal` for a signalled child.
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }
}

/// Kills the child's process group on drop unless disarmed, and stops the
/// signal forwarder either way.
struct GroupGuard {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: i32,
    armed: bool,
    forwarder: Option<AbortHandle>,
}

impl GroupGuard {
    fn new(pgid: i32) -> Self {
        Self {
            pgid,
            armed: true,
            forwarder: None,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    fn stop_forwarding(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.stop_forwarding();
        if self.armed {
            signal_group(self.pgid, Signal::Kill);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: i32, signal: Signal) {
    let sig = match signal {
        Signal::Interrupt => libc::SIGINT,
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: killpg only sends a signal; a stale pgid yields ESRCH.
    unsafe {
        libc::killpg(pgid, sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: i32, _signal: Signal) {}

/// Run a child to completion, relaying its output to the log line by line.
///
/// SIGINT and SIGTERM received by this process are forwarded to the child's
/// group while it runs. Dropping the returned future kills the group.
pub async fn spawn_and_stream(config: ProcessConfig) -> Result<ProcessOutput> {
    let ProcessConfig {
        command,
        args,
        working_dir,
        timeout,
        log_prefix,
        env,
        stdin_data,
    } = config;

    let mut child = build_command(&command, &args, &working_dir, &env, stdin_data.is_some())
        .spawn()
        .map_err(|e| Error::Process(format!("failed to spawn '{command}': {e}")))?;
    let pgid = child
        .id()
        .ok_or_else(|| Error::Process(format!("'{command}' exited before it got a pid")))?
        as i32;
    let mut guard = GroupGuard::new(pgid);
    debug!(command = %command, pgid, "child started");

    if let Some(data) = stdin_data {
        feed_stdin(&mut child, data)?;
    }
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Process("stdout is not piped".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Process("stderr is not piped".into()))?;
    let stdout_task = relay_lines(stdout, log_prefix.clone(), false);
    let stderr_task = relay_lines(stderr, log_prefix, true);
    guard.forwarder = Some(forward_signals(pgid).abort_handle());

    let waited = match timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
        None => Some(child.wait().await),
    };
    guard.stop_forwarding();

    let Some(status) = waited else {
        signal_group(pgid, Signal::Terminate);
        tokio::time::sleep(KILL_GRACE).await;
        signal_group(pgid, Signal::Kill);
        guard.disarm();
        stdout_task.abort();
        stderr_task.abort();
        let limit = timeout.unwrap_or_default();
        return Err(Error::Process(format!(
            "'{command}' timed out after {limit:?}"
        )));
    };
    guard.disarm();
    let status = status.map_err(|e| Error::Process(format!("wait on '{command}' failed: {e}")))?;

    let stdout_lines = stdout_task
        .await
        .map_err(|e| Error::Process(format!("stdout reader failed: {e}")))?;
    let stderr_lines = stderr_task
        .await
        .map_err(|e| Error::Process(format!("stderr reader failed: {e}")))?;

    let (exit_code, signal) = exit_info(&status);
    debug!(command = %command, exit_code, ?signal, "child exited");
    Ok(ProcessOutput {
        exit_code,
        signal,
        stdout_lines,
        stderr_lines,
    })
}

fn build_command(
    program: &str,
    args: &[String],
    working_dir: &Path,
    env: &[(String, String)],
    piped_stdin: bool,
) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(working_dir)
        .envs(env.iter().map(|(k, v)| (k, v)))
        .stdin(if piped_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

fn feed_stdin(child: &mut Child, data: String) -> Result<()> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Process("stdin is not piped".into()))?;
    tokio::spawn(async move {
        if let Err(e) = stdin.write_all(data.as_bytes()).await {
            warn!(error = %e, "failed to write child stdin");
        }
        // stdin drops here, so the child sees EOF
    });
    Ok(())
}

fn relay_lines<R>(stream: R, prefix: String, is_stderr: bool) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stream).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if is_stderr {
                warn!("[{prefix}] {line}");
            } else {
                info!("[{prefix}] {line}");
            }
            lines.push(line);
        }
        lines
    })
}

#[cfg(unix)]
fn forward_signals(pgid: i32) -> JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let (Ok(mut interrupt), Ok(mut terminate)) = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) else {
            warn!("failed to install signal forwarding");
            return;
        };
        loop {
            tokio::select! {
                _ = interrupt.recv() => signal_group(pgid, Signal::Interrupt),
                _ = terminate.recv() => signal_group(pgid, Signal::Terminate),
            }
        }
    })
}

#[cfg(not(unix))]
fn forward_signals(_pgid: i32) -> JoinHandle<()> {
    tokio::spawn(async {})
}

fn exit_info(status: &ExitStatus) -> (i32, Option<i32>) {
    if let Some(code) = status.code() {
        return (code, None);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return (128 + sig, Some(sig));
        }
    }
    (-1, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[cfg(unix)]
    async fn test_dropped_guard_stops_signal_forwarder() {
        let forwarder = forward_signals(i32::MAX);
        let mut guard = GroupGuard::new(i32::MAX);
        guard.forwarder = Some(forwarder.abort_handle());
        guard.disarm();
        drop(guard);

        let err = forwarder.await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    #[cfg(unix)]
    fn test_exit_info_for_plain_exit() {
        let status = std::process::Command::new("sh")
            .args(["-c", "exit 7"])
            .status()
            .unwrap();
        assert_eq!(exit_info(&status), (7, None));
    }
}
