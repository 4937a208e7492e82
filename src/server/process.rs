// src/server/process.rs
use crate::config::ServerSpec;
use crate::error::{Error, Result};
use async_process::{Child, Command, Stdio};
use futures_lite::StreamExt;
use futures_lite::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use std::fmt;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Environment variables overridden for every child.
pub const HOST_ENV: &str = "SERVER_HOST";
pub const PORT_ENV: &str = "SERVER_PORT";
pub const NAME_ENV: &str = "SERVER_NAME";

const STDERR_CAPTURE_LIMIT: u64 = 16 * 1024;
const STDERR_CAPTURE_TIMEOUT: Duration = Duration::from_secs(1);

/// Unique identifier for one launch of a server process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerId(Uuid);

impl ServerId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle phase of a server process
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Never launched
    NotStarted,
    /// Spawned, inside the startup grace period
    Starting,
    /// Server is running
    Running,
    /// Terminate signal sent, waiting for exit
    Stopping,
    /// Server has stopped
    Stopped,
    /// Server failed to start or crashed
    Failed,
}

/// Result of polling a child for exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// The child exited; carries the exit status text.
    Exited(String),
    /// No child is attached.
    NotRunning,
    /// Polling itself failed.
    Unknown(String),
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// Exited after the terminate signal.
    Graceful { exit_code: Option<i32> },
    /// Force killed after the timeout.
    Killed { exit_code: Option<i32> },
    /// Force killed but could not be reaped within the grace period.
    Unreaped,
}

impl StopOutcome {
    pub fn is_clean(self) -> bool {
        !matches!(self, StopOutcome::Unreaped)
    }
}

/// A supervised server process
pub struct ServerProcess {
    spec: ServerSpec,
    name: String,
    id: ServerId,
    child: Option<Child>,
    status: ServerStatus,
    stderr_task: Option<JoinHandle<()>>,
}

impl ServerProcess {
    pub fn new(name: String, spec: ServerSpec) -> Self {
        Self {
            spec,
            name,
            id: ServerId::new(),
            child: None,
            status: ServerStatus::NotStarted,
            stderr_task: None,
        }
    }

    /// Identifier of the current (or most recent) launch
    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn has_child(&self) -> bool {
        self.child.is_some()
    }

    /// Spawns the process and waits `launch_grace` for it to settle.
    ///
    /// A child that exits within the grace period is a launch failure; its
    /// stderr is captured into the error.
    pub async fn start(&mut self, host: &str, launch_grace: Duration) -> Result<()> {
        if self.child.is_some() {
            return Err(Error::Process(format!("Server '{}' is already running", self.name)));
        }

        self.status = ServerStatus::Starting;
        self.id = ServerId::new();

        let mut command = Command::new(&self.spec.command);
        command.args(&self.spec.args);

        for (key, value) in &self.spec.env {
            command.env(key, value);
        }
        command.env(HOST_ENV, host).env(NAME_ENV, &self.name);
        if let Some(port) = self.spec.port {
            command.env(PORT_ENV, port.to_string());
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            self.status = ServerStatus::Failed;
            Error::Launch(format!("Failed to start process '{}': {}", self.spec.command, e))
        })?;

        tokio::time::sleep(launch_grace).await;

        match child.try_status() {
            Ok(None) => {
                if let Some(stderr) = child.stderr.take() {
                    let name = self.name.clone();
                    self.stderr_task = Some(tokio::spawn(async move {
                        let mut lines = BufReader::new(stderr).lines();
                        while let Some(Ok(line)) = lines.next().await {
                            tracing::debug!(server = %name, "{}", line);
                        }
                    }));
                }
                self.child = Some(child);
                self.status = ServerStatus::Running;
                Ok(())
            }
            Ok(Some(exit)) => {
                let stderr = capture_stderr(&mut child).await;
                self.status = ServerStatus::Failed;
                Err(Error::Launch(format!(
                    "Process exited during startup ({}): {}",
                    exit,
                    stderr.trim()
                )))
            }
            Err(e) => {
                let _ = child.kill();
                self.status = ServerStatus::Failed;
                Err(Error::Launch(format!("Failed to poll new process: {}", e)))
            }
        }
    }

    /// Checks whether the child is still alive without blocking.
    pub fn poll_liveness(&mut self) -> Liveness {
        let Some(child) = self.child.as_mut() else {
            return Liveness::NotRunning;
        };

        match child.try_status() {
            Ok(None) => Liveness::Alive,
            Ok(Some(exit)) => {
                self.child = None;
                self.abort_stderr_task();
                self.status = ServerStatus::Failed;
                Liveness::Exited(exit.to_string())
            }
            Err(e) => Liveness::Unknown(e.to_string()),
        }
    }

    /// Sends a graceful terminate signal, then force kills after `timeout`.
    pub async fn stop(&mut self, timeout: Duration, kill_grace: Duration) -> StopOutcome {
        let Some(mut child) = self.child.take() else {
            if self.status != ServerStatus::NotStarted {
                self.status = ServerStatus::Stopped;
            }
            return StopOutcome::NotRunning;
        };

        self.status = ServerStatus::Stopping;
        terminate(&mut child);

        let outcome = match tokio::time::timeout(timeout, child.status()).await {
            Ok(Ok(exit)) => StopOutcome::Graceful {
                exit_code: exit.code(),
            },
            Ok(Err(e)) => {
                tracing::warn!(server = %self.name, error = %e, "Failed to wait for process, killing");
                force_kill(&mut child, kill_grace).await
            }
            Err(_) => {
                tracing::warn!(server = %self.name, ?timeout, "Process did not exit in time, killing");
                force_kill(&mut child, kill_grace).await
            }
        };

        self.abort_stderr_task();
        self.status = ServerStatus::Stopped;
        outcome
    }

    fn abort_stderr_task(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    let pid = child.id() as libc::pid_t;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        tracing::debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
}

async fn force_kill(child: &mut Child, kill_grace: Duration) -> StopOutcome {
    if let Err(e) = child.kill() {
        tracing::debug!(error = %e, "Kill failed");
    }
    match tokio::time::timeout(kill_grace, child.status()).await {
        Ok(Ok(exit)) => StopOutcome::Killed {
            exit_code: exit.code(),
        },
        _ => StopOutcome::Unreaped,
    }
}

async fn capture_stderr(child: &mut Child) -> String {
    let Some(stderr) = child.stderr.take() else {
        return String::new();
    };

    let mut buf = String::new();
    let mut limited = stderr.take(STDERR_CAPTURE_LIMIT);
    let _ = tokio::time::timeout(STDERR_CAPTURE_TIMEOUT, limited.read_to_string(&mut buf)).await;
    buf
}
