/// Server management module for Fleet Runner.
///
/// This module holds the building blocks the orchestrator drives: one
/// `ServerProcess` per managed subprocess, the audited lifecycle events,
/// the port probe and the background health loop.
///
/// # Components
///
/// * `lifecycle` - Lifecycle events and their audit trail
/// * `monitor` - Cancellable background health loop
/// * `probe` - Port reachability checks
/// * `process` - Spawning, polling and stopping a single subprocess
///
/// # Examples
///
/// Running a single process by hand:
///
/// ```no_run
/// use fleet_runner::config::ServerSpec;
/// use fleet_runner::server::{ServerProcess, ServerStatus};
/// use std::time::Duration;
///
/// # async fn run() -> fleet_runner::Result<()> {
/// let spec = ServerSpec {
///     command: "python3".to_string(),
///     args: vec!["-m".to_string(), "http.server".to_string(), "9200".to_string()],
///     port: Some(9200),
///     ..ServerSpec::default()
/// };
/// let mut process = ServerProcess::new("http".to_string(), spec);
/// process.start("127.0.0.1", Duration::from_millis(500)).await?;
/// assert_eq!(process.status(), ServerStatus::Running);
/// process.stop(Duration::from_secs(5), Duration::from_secs(1)).await;
/// # Ok(())
/// # }
/// ```
pub mod lifecycle;
pub mod monitor;
pub mod probe;
mod process;

pub use lifecycle::{ServerLifecycleEvent, ServerLifecycleManager};
pub use monitor::{ServerHealth, ServerMonitor, ServerMonitorConfig};
pub use probe::{PortProbe, TcpProbe};
pub use process::{
    HOST_ENV, Liveness, NAME_ENV, PORT_ENV, ServerId, ServerProcess, ServerStatus, StopOutcome,
};
