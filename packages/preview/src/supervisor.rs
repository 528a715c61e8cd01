// ABOUTME: Child process supervision for sandbox install and dev-server commands
// ABOUTME: Spawns in a dedicated process group, streams output lines and terminates gracefully then forcibly

use crate::types::{SandboxError, SandboxResult};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How long output readers may keep draining after the process exits
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for the exit to be observed after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(2);

/// How a child process ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {}", code),
            (None, Some(signal)) => format!("killed by signal {}", signal),
            (None, None) => "exited with unknown status".to_string(),
        }
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Output and lifecycle events of a supervised process.
///
/// `Exited` is always the last event on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    Exited(ExitInfo),
}

/// Reference to a running child. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    /// Wait until the process has exited.
    pub async fn wait(&self) -> ExitInfo {
        let mut exit = self.exit.clone();
        let waited = exit
            .wait_for(Option::is_some)
            .await
            .map(|info| info.unwrap_or_default());
        match waited {
            Ok(info) => info,
            // Sender dropped; the last published value is final
            Err(_) => exit.borrow().unwrap_or_default(),
        }
    }
}

/// Spawns and terminates sandbox child processes.
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    /// Spawn `command_line` in `dir` with extra environment variables.
    ///
    /// The command line is split on whitespace; the first word is the program. The
    /// child becomes the leader of a new process group so that [`terminate`] also
    /// reaches anything it spawns (package managers fork the real server).
    ///
    /// # Returns
    ///
    /// The process handle and a stream of [`ProcessEvent`]s ending with `Exited`.
    ///
    /// [`terminate`]: ProcessSupervisor::terminate
    pub fn spawn(
        dir: &Path,
        command_line: &str,
        env: &[(&str, String)],
    ) -> SandboxResult<(ProcessHandle, mpsc::UnboundedReceiver<ProcessEvent>)> {
        let mut words = command_line.split_whitespace();
        let program = words.next().ok_or_else(|| SandboxError::ProcessSpawnError {
            command: command_line.to_string(),
            error: "Command line is empty".to_string(),
        })?;

        let mut command = Command::new(program);
        command
            .args(words)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in env {
            command.env(key, value);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| SandboxError::ProcessSpawnError {
            command: command_line.to_string(),
            error: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| SandboxError::ProcessSpawnError {
            command: command_line.to_string(),
            error: "Process exited before its PID could be read".to_string(),
        })?;

        info!("Spawned '{}' in {} with PID {}", command_line, dir.display(), pid);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, events_tx.clone(), ProcessEvent::Stdout)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, events_tx.clone(), ProcessEvent::Stderr)));

        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    warn!("Failed to wait on PID {}: {}", pid, e);
                    ExitInfo::default()
                }
            };
            exit_tx.send_replace(Some(exit));
            debug!("PID {} {}", pid, exit.describe());

            let drain = async {
                for task in [stdout_task, stderr_task].into_iter().flatten() {
                    let _ = task.await;
                }
            };
            if timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
                debug!("Output of PID {} still open after exit, not waiting further", pid);
            }

            let _ = events_tx.send(ProcessEvent::Exited(exit));
        });

        Ok((ProcessHandle { pid, exit: exit_rx }, events_rx))
    }

    /// Terminate a process group: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// A process that is already gone counts as terminated.
    pub async fn terminate(handle: &ProcessHandle, grace: Duration) -> SandboxResult<()> {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::Signal;

            let pid = handle.pid();

            if handle.has_exited() {
                // Leader is gone; sweep anything left in its group
                let _ = signal_group(pid, Signal::SIGTERM);
                return Ok(());
            }

            match signal_group(pid, Signal::SIGTERM) {
                Ok(()) => info!("Sent SIGTERM to process group {}", pid),
                Err(Errno::ESRCH) => {
                    debug!("Process group {} already gone", pid);
                    return Ok(());
                }
                Err(e) => {
                    return Err(SandboxError::ProcessKillError {
                        pid,
                        error: format!("Failed to send SIGTERM: {}", e),
                    })
                }
            }

            if timeout(grace, handle.wait()).await.is_ok() {
                info!("Process {} terminated gracefully after SIGTERM", pid);
                return Ok(());
            }

            warn!(
                "Process {} did not respond to SIGTERM within {}ms, sending SIGKILL",
                pid,
                grace.as_millis()
            );
            match signal_group(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(SandboxError::ProcessKillError {
                        pid,
                        error: format!("Failed to send SIGKILL: {}", e),
                    })
                }
            }

            if timeout(KILL_WAIT, handle.wait()).await.is_ok() {
                info!("Process {} terminated after SIGKILL", pid);
                Ok(())
            } else {
                error!("Process {} did not terminate even after SIGKILL", pid);
                Err(SandboxError::ProcessKillError {
                    pid,
                    error: "Process did not terminate even after SIGKILL".to_string(),
                })
            }
        }

        #[cfg(not(unix))]
        {
            let _ = grace;
            warn!(
                "Process group termination not implemented for this platform (PID {})",
                handle.pid()
            );
            Ok(())
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> nix::Result<()> {
    let pgid = i32::try_from(pid).map_err(|_| nix::errno::Errno::EINVAL)?;
    nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pgid), signal)
}

async fn forward_lines<R>(
    reader: R,
    events: mpsc::UnboundedSender<ProcessEvent>,
    wrap: fn(String) -> ProcessEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if events.send(wrap(line)).is_err() {
            break;
        }
    }
}
