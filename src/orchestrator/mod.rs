//! Fleet orchestration.
//!
//! The `Orchestrator` launches the servers of a registry in tier/priority
//! order, stops them, and runs the background health loop that restarts
//! crashed processes. Each server's breaker decides whether a failure may
//! still trigger a restart; while it is open the loop only observes.
//!
//! Every transition is written to the hash-chain log under the server's
//! audit category.
mod state;

pub use state::{FleetMetrics, HealthCheckOutcome, ManagedServerState, ServerMetrics};

use crate::audit::{Details, HashChainLog, details};
use crate::breaker::{Admission, BreakerRegistry, BreakerStatus, BreakerTransition};
use crate::config::{Config, ServerSpec, validate_config};
use crate::error::{Error, Result};
use crate::server::{
    Liveness, PortProbe, ServerHealth, ServerLifecycleEvent, ServerLifecycleManager,
    ServerMonitor, ServerMonitorConfig, ServerProcess, ServerStatus, StopOutcome, TcpProbe,
};
use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// One registry entry plus its runtime.
struct ManagedServer {
    spec: ServerSpec,
    /// Serializes every start/stop/restart/check of this server.
    process: Mutex<ServerProcess>,
    state: std::sync::Mutex<ManagedServerState>,
}

impl ManagedServer {
    fn state(&self) -> MutexGuard<'_, ManagedServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Inner {
    config: Config,
    lifecycle: ServerLifecycleManager,
    breakers: BreakerRegistry,
    probe: Arc<dyn PortProbe>,
    servers: HashMap<String, ManagedServer>,
    monitor: Mutex<ServerMonitor>,
}

/// Supervises the managed servers of one registry.
///
/// Cloning is cheap; clones share the same fleet.
///
/// # Examples
///
/// ```no_run
/// use fleet_runner::audit::{HashChainLog, LogOptions};
/// use fleet_runner::config::Config;
/// use fleet_runner::Orchestrator;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> fleet_runner::Result<()> {
///     let audit = Arc::new(HashChainLog::open("audit", LogOptions::default())?);
///     let orchestrator = Orchestrator::new(Config::from_file("fleet.json")?, audit)?;
///
///     let started = orchestrator.start_all().await?;
///     println!("{:?}", started);
///
///     orchestrator.start_monitoring().await?;
///     tokio::signal::ctrl_c().await?;
///     orchestrator.shutdown().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Creates an orchestrator that probes ports over TCP.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigInvalid` if the registry fails validation, or
    /// `Error::ChainWrite` if the startup entry cannot be audited.
    pub fn new(config: Config, audit: Arc<HashChainLog>) -> Result<Self> {
        Self::with_probe(config, audit, Arc::new(TcpProbe))
    }

    /// Creates an orchestrator from a registry file.
    #[tracing::instrument(skip(path, audit), fields(config_path = ?path.as_ref()))]
    pub fn from_config_file(path: impl AsRef<Path>, audit: Arc<HashChainLog>) -> Result<Self> {
        tracing::info!("Loading registry from file");
        Self::new(Config::from_file(path)?, audit)
    }

    /// Creates an orchestrator with a custom port probe.
    #[tracing::instrument(skip_all, fields(num_servers = config.servers.len()))]
    pub fn with_probe(
        config: Config,
        audit: Arc<HashChainLog>,
        probe: Arc<dyn PortProbe>,
    ) -> Result<Self> {
        validate_config(&config)?;

        let servers = config
            .servers
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    ManagedServer {
                        spec: spec.clone(),
                        process: Mutex::new(ServerProcess::new(name.clone(), spec.clone())),
                        state: std::sync::Mutex::new(ManagedServerState::default()),
                    },
                )
            })
            .collect();

        let monitor = ServerMonitor::new(ServerMonitorConfig {
            check_interval: config.settings.check_interval(),
        });

        let inner = Inner {
            breakers: BreakerRegistry::new(config.settings.breaker.clone()),
            lifecycle: ServerLifecycleManager::new(audit),
            probe,
            servers,
            monitor: Mutex::new(monitor),
            config,
        };

        inner.lifecycle.audit().append(
            "orchestrator_started",
            "system",
            details([
                ("servers", json!(inner.config.servers.len())),
                ("startup_order", json!(inner.config.startup_order())),
            ]),
        )?;

        tracing::info!("Orchestrator created");
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn audit(&self) -> &Arc<HashChainLog> {
        self.inner.lifecycle.audit()
    }

    pub fn lifecycle(&self) -> &ServerLifecycleManager {
        &self.inner.lifecycle
    }

    fn server(&self, name: &str) -> Result<&ManagedServer> {
        self.inner
            .servers
            .get(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))
    }

    /// Snapshot of one server's runtime state.
    pub fn state(&self, name: &str) -> Result<ManagedServerState> {
        Ok(self.server(name)?.state().clone())
    }

    pub fn breaker_status(&self, name: &str) -> Result<BreakerStatus> {
        self.server(name)?;
        Ok(self.inner.breakers.get(name).status())
    }

    fn record(
        &self,
        name: &str,
        server: &ManagedServer,
        event: ServerLifecycleEvent,
        details: Details,
    ) -> Result<String> {
        self.inner
            .lifecycle
            .record_event(name, &server.spec.audit_category, event, details)
    }

    fn record_transition(
        &self,
        name: &str,
        server: &ManagedServer,
        transition: Option<BreakerTransition>,
    ) -> Result<()> {
        if let Some(t) = transition {
            self.record(
                name,
                server,
                ServerLifecycleEvent::from_transition(t),
                details([
                    ("from", json!(t.from.to_string())),
                    ("to", json!(t.to.to_string())),
                ]),
            )?;
        }
        Ok(())
    }

    /// Starts one server.
    ///
    /// Returns `Ok(true)` once the server runs (or already ran) and
    /// `Ok(false)` for a disabled server or a failed launch; both are
    /// audited. Only a missing server or an audit write failure is an error.
    #[tracing::instrument(skip(self), fields(server = %name))]
    pub async fn start(&self, name: &str) -> Result<bool> {
        let server = self.server(name)?;
        let mut process = server.process.lock().await;
        self.start_locked(name, server, &mut process).await
    }

    async fn start_locked(
        &self,
        name: &str,
        server: &ManagedServer,
        process: &mut ServerProcess,
    ) -> Result<bool> {
        if !server.spec.enabled {
            tracing::warn!("Refusing to start disabled server");
            server.state().error_message = Some("server is disabled".to_string());
            self.record(name, server, ServerLifecycleEvent::StartRejected, details([(
                "reason",
                json!("disabled"),
            )]))?;
            return Ok(false);
        }

        if process.poll_liveness() == Liveness::Alive {
            tracing::debug!("Server already running");
            return Ok(true);
        }

        server.state().status = ServerStatus::Starting;
        let settings = &self.inner.config.settings;
        let launched = process
            .start(&settings.host, settings.launch_grace())
            .await;

        let instance_id = process.id().to_string();
        match launched {
            Ok(()) => {
                let pid = process.pid();
                {
                    let mut state = server.state();
                    state.status = ServerStatus::Running;
                    state.running = true;
                    state.healthy = false;
                    state.health = ServerHealth::Unknown;
                    state.error_message = None;
                    state.started_at = Some(Utc::now());
                    state.instance_id = Some(instance_id.clone());
                    state.pid = pid;
                    state.tracked = true;
                }
                tracing::info!(?pid, "Server started");
                self.record(name, server, ServerLifecycleEvent::Started, details([
                    ("instance_id", json!(instance_id)),
                    ("pid", json!(pid)),
                    ("port", json!(server.spec.port)),
                    ("priority", json!(server.spec.priority)),
                    ("tier", json!(server.spec.tier)),
                ]))?;
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Server failed to start");
                {
                    let mut state = server.state();
                    state.status = ServerStatus::Failed;
                    state.running = false;
                    state.healthy = false;
                    state.health = ServerHealth::Unhealthy;
                    state.error_message = Some(e.to_string());
                    state.started_at = None;
                    state.pid = None;
                    state.tracked = true;
                }
                self.record(name, server, ServerLifecycleEvent::StartFailed, details([
                    ("error", json!(e.to_string())),
                    ("instance_id", json!(instance_id)),
                ]))?;
                Ok(false)
            }
        }
    }

    /// Stops one server, force killing it after `timeout`.
    ///
    /// Stopping an unknown or already stopped server succeeds.
    #[tracing::instrument(skip(self), fields(server = %name))]
    pub async fn stop(&self, name: &str, timeout: Duration) -> Result<bool> {
        let Ok(server) = self.server(name) else {
            tracing::debug!("Stop requested for unknown server");
            return Ok(true);
        };
        let mut process = server.process.lock().await;
        self.stop_locked(name, server, &mut process, timeout).await
    }

    async fn stop_locked(
        &self,
        name: &str,
        server: &ManagedServer,
        process: &mut ServerProcess,
        timeout: Duration,
    ) -> Result<bool> {
        server.state().tracked = false;

        if !process.has_child() {
            let mut state = server.state();
            state.running = false;
            state.healthy = false;
            if state.status != ServerStatus::NotStarted {
                state.status = ServerStatus::Stopped;
            }
            tracing::debug!("Server not running");
            return Ok(true);
        }

        server.state().status = ServerStatus::Stopping;
        let instance_id = process.id().to_string();
        let outcome = process
            .stop(timeout, self.inner.config.settings.kill_grace())
            .await;

        {
            let mut state = server.state();
            state.status = ServerStatus::Stopped;
            state.running = false;
            state.healthy = false;
            state.health = ServerHealth::Unknown;
            state.started_at = None;
            state.pid = None;
        }

        let (how, exit_code) = match outcome {
            StopOutcome::NotRunning => ("not_running", None),
            StopOutcome::Graceful { exit_code } => ("graceful", exit_code),
            StopOutcome::Killed { exit_code } => ("killed", exit_code),
            StopOutcome::Unreaped => ("unreaped", None),
        };
        tracing::info!(outcome = how, "Server stopped");
        self.record(name, server, ServerLifecycleEvent::Stopped, details([
            ("exit_code", json!(exit_code)),
            ("instance_id", json!(instance_id)),
            ("outcome", json!(how)),
        ]))?;

        Ok(outcome.is_clean())
    }

    /// Stops then starts one server.
    #[tracing::instrument(skip(self), fields(server = %name))]
    pub async fn restart(&self, name: &str) -> Result<bool> {
        let server = self.server(name)?;
        let mut process = server.process.lock().await;
        self.restart_locked(name, server, &mut process, "requested").await
    }

    async fn restart_locked(
        &self,
        name: &str,
        server: &ManagedServer,
        process: &mut ServerProcess,
        reason: &str,
    ) -> Result<bool> {
        tracing::info!(reason, "Restarting server");
        let timeout = self.inner.config.settings.stop_timeout();
        self.stop_locked(name, server, process, timeout).await?;
        let started = self.start_locked(name, server, process).await?;

        server.state().restarts += 1;
        self.record(name, server, ServerLifecycleEvent::Restarted, details([
            ("reason", json!(reason)),
            ("success", json!(started)),
        ]))?;
        Ok(started)
    }

    /// Starts every enabled server in `(tier, priority)` order.
    ///
    /// A server that fails to launch is reported as `false` and does not
    /// stop the others.
    #[tracing::instrument(skip(self))]
    pub async fn start_all(&self) -> Result<HashMap<String, bool>> {
        let order = self.inner.config.startup_order();
        tracing::info!(servers_to_start = ?order, "Starting all servers");

        let mut results = HashMap::new();
        for name in order {
            let started = self.start(&name).await?;
            results.insert(name, started);
        }

        let failed = results.values().filter(|ok| !**ok).count();
        if failed > 0 {
            tracing::warn!(num_failed = failed, "Some servers failed to start");
        }
        Ok(results)
    }

    /// Stops every running server.
    ///
    /// Never bails out early: an audit failure for one server is logged and
    /// that server reported as `false`.
    #[tracing::instrument(skip(self))]
    pub async fn stop_all(&self, timeout: Duration) -> HashMap<String, bool> {
        let mut order = self.inner.config.startup_order();
        order.reverse();

        let mut results = HashMap::new();
        for name in order {
            let active = {
                let state = self.inner.servers[&name].state();
                state.running || state.tracked
            };
            if !active {
                continue;
            }

            let stopped = match self.stop(&name, timeout).await {
                Ok(stopped) => stopped,
                Err(e) => {
                    tracing::error!(server = %name, error = %e, "Failed to stop server");
                    false
                }
            };
            results.insert(name, stopped);
        }
        results
    }

    /// Runs one health check against one server.
    #[tracing::instrument(skip(self), fields(server = %name))]
    pub async fn check_server(&self, name: &str) -> Result<HealthCheckOutcome> {
        let server = self.server(name)?;
        let mut process = server.process.lock().await;

        if !server.state().tracked {
            return Ok(HealthCheckOutcome::NotTracked);
        }

        let breaker = self.inner.breakers.get(name);
        match breaker.allow_request() {
            Admission::Rejected => {
                tracing::debug!("Circuit breaker open, skipping check");
                return Ok(HealthCheckOutcome::Skipped);
            }
            Admission::HalfOpened => {
                self.record_transition(name, server, Some(BreakerTransition {
                    from: BreakerStatus::Open,
                    to: BreakerStatus::HalfOpen,
                }))?;
            }
            Admission::Allowed => {}
        }

        {
            let mut state = server.state();
            state.checks += 1;
            state.last_health_check_time = Some(Utc::now());
        }

        match process.poll_liveness() {
            Liveness::Alive => {}
            Liveness::Exited(exit) => {
                tracing::warn!(exit = %exit, "Server process exited");
                self.mark_down(server, Some(format!("process exited: {}", exit)));
                self.record(name, server, ServerLifecycleEvent::Crashed, details([(
                    "exit_status",
                    json!(exit),
                )]))?;
                return self.handle_down(name, server, &mut process, &breaker).await;
            }
            Liveness::NotRunning => {
                self.mark_down(server, None);
                return self.handle_down(name, server, &mut process, &breaker).await;
            }
            Liveness::Unknown(e) => {
                tracing::debug!(error = %e, "Liveness poll failed");
                self.probe_failed(name, server, &breaker, e)?;
                return Ok(HealthCheckOutcome::Unhealthy { restarted: false });
            }
        }

        let probed = match server.spec.port {
            None => Ok(()),
            Some(port) => {
                let settings = &self.inner.config.settings;
                self.inner
                    .probe
                    .probe(&settings.host, port, settings.probe_timeout())
                    .await
            }
        };

        match probed {
            Ok(()) => {
                let flipped = {
                    let mut state = server.state();
                    let flipped = state.health != ServerHealth::Healthy;
                    state.healthy = true;
                    state.health = ServerHealth::Healthy;
                    state.error_message = None;
                    flipped
                };
                if flipped {
                    self.record(name, server, ServerLifecycleEvent::HealthChanged, details([(
                        "healthy",
                        json!(true),
                    )]))?;
                }
                self.record_transition(name, server, breaker.record_success())?;
                Ok(HealthCheckOutcome::Healthy)
            }
            Err(e) => {
                // A live process that does not answer yet is not restarted.
                tracing::debug!(error = %e, "Port probe failed");
                self.probe_failed(name, server, &breaker, e.to_string())?;
                Ok(HealthCheckOutcome::Unhealthy { restarted: false })
            }
        }
    }

    fn mark_down(&self, server: &ManagedServer, error: Option<String>) {
        let mut state = server.state();
        state.running = false;
        state.healthy = false;
        state.health = ServerHealth::Unhealthy;
        state.status = ServerStatus::Failed;
        state.failed_checks += 1;
        state.started_at = None;
        state.pid = None;
        if let Some(error) = error {
            state.error_message = Some(error);
        }
    }

    /// A dead process counts against the breaker and is restarted only
    /// while the breaker stays closed.
    async fn handle_down(
        &self,
        name: &str,
        server: &ManagedServer,
        process: &mut ServerProcess,
        breaker: &crate::breaker::CircuitBreaker,
    ) -> Result<HealthCheckOutcome> {
        if breaker.status() == BreakerStatus::HalfOpen {
            // The restart itself is the trial call.
            let started = self
                .restart_locked(name, server, process, "half_open_trial")
                .await?;
            let transition = if started {
                breaker.record_success()
            } else {
                breaker.record_failure()
            };
            self.record_transition(name, server, transition)?;
            return Ok(HealthCheckOutcome::Unhealthy { restarted: true });
        }

        self.record_transition(name, server, breaker.record_failure())?;

        if breaker.status() != BreakerStatus::Closed {
            tracing::warn!(breaker = %breaker.status(), "Not restarting, circuit breaker tripped");
            return Ok(HealthCheckOutcome::Unhealthy { restarted: false });
        }

        self.restart_locked(name, server, process, "health_check")
            .await?;
        Ok(HealthCheckOutcome::Unhealthy { restarted: true })
    }

    fn probe_failed(
        &self,
        name: &str,
        server: &ManagedServer,
        breaker: &crate::breaker::CircuitBreaker,
        error: String,
    ) -> Result<()> {
        let flipped = {
            let mut state = server.state();
            let flipped = state.health != ServerHealth::Unhealthy;
            state.healthy = false;
            state.health = ServerHealth::Unhealthy;
            state.failed_checks += 1;
            state.error_message = Some(error.clone());
            flipped
        };
        if flipped {
            self.record(name, server, ServerLifecycleEvent::HealthChanged, details([
                ("error", json!(error)),
                ("healthy", json!(false)),
            ]))?;
        }
        self.record_transition(name, server, breaker.record_failure())
    }

    /// One sequential health pass over every tracked server.
    pub async fn check_all(&self) -> Result<BTreeMap<String, HealthCheckOutcome>> {
        self.sweep(None).await
    }

    async fn sweep(
        &self,
        token: Option<&CancellationToken>,
    ) -> Result<BTreeMap<String, HealthCheckOutcome>> {
        let mut outcomes = BTreeMap::new();
        for name in self.inner.config.startup_order() {
            if token.is_some_and(|t| t.is_cancelled()) {
                break;
            }
            let outcome = self.check_server(&name).await?;
            if outcome != HealthCheckOutcome::NotTracked {
                outcomes.insert(name, outcome);
            }
        }
        Ok(outcomes)
    }

    /// Operator override: closes the server's breaker and clears its counters.
    #[tracing::instrument(skip(self), fields(server = %name))]
    pub fn reset_breaker(&self, name: &str) -> Result<()> {
        let server = self.server(name)?;
        let previous = self.inner.breakers.get(name).status();
        self.inner.breakers.reset(name);
        tracing::info!(%previous, "Circuit breaker reset by operator");
        self.record(name, server, ServerLifecycleEvent::BreakerReset, details([(
            "previous",
            json!(previous.to_string()),
        )]))?;
        Ok(())
    }

    /// Starts the background health loop. A running loop is left alone.
    pub async fn start_monitoring(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        let mut monitor = self.inner.monitor.lock().await;
        monitor.start(move |token| {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let orchestrator = Orchestrator { inner };
                if let Err(e) = orchestrator.sweep(Some(&token)).await {
                    tracing::error!(error = %e, "Health check pass failed");
                }
            }
        })
    }

    /// Stops the health loop, letting an in-flight pass finish.
    pub async fn stop_monitoring(&self) {
        self.inner.monitor.lock().await.stop().await;
    }

    pub async fn is_monitoring(&self) -> bool {
        self.inner.monitor.lock().await.is_running()
    }

    /// Stops the health loop, then every server, and audits the shutdown.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<HashMap<String, bool>> {
        tracing::info!("Shutting down fleet");
        self.stop_monitoring().await;

        let results = self
            .stop_all(self.inner.config.settings.stop_timeout())
            .await;

        self.audit().append(
            "orchestrator_shutdown",
            "system",
            details([
                ("stopped", json!(results.values().filter(|ok| **ok).count())),
                ("failed", json!(results.values().filter(|ok| !**ok).count())),
            ]),
        )?;
        Ok(results)
    }

    /// Read-only fleet snapshot.
    pub fn metrics(&self) -> FleetMetrics {
        let breakers = self.inner.breakers.snapshot_all();
        let mut servers = BTreeMap::new();

        for (name, server) in &self.inner.servers {
            let state = server.state().clone();
            servers.insert(name.clone(), ServerMetrics {
                enabled: server.spec.enabled,
                status: state.status,
                running: state.running,
                healthy: state.healthy,
                uptime_secs: state.uptime_secs(),
                error_rate: state.error_rate(),
                checks: state.checks,
                failed_checks: state.failed_checks,
                restarts: state.restarts,
                breaker: breakers
                    .get(name)
                    .map(|b| b.status)
                    .unwrap_or(BreakerStatus::Closed),
                last_health_check_time: state.last_health_check_time,
                error_message: state.error_message,
            });
        }

        FleetMetrics {
            configured: servers.len(),
            enabled: servers.values().filter(|s| s.enabled).count(),
            running: servers.values().filter(|s| s.running).count(),
            healthy: servers.values().filter(|s| s.healthy).count(),
            servers,
        }
    }
}
