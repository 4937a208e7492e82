use crate::breaker::BreakerStatus;
use crate::server::{ServerHealth, ServerStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Runtime state of one managed server, owned by the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct ManagedServerState {
    pub status: ServerStatus,
    /// A live process handle is attached.
    pub running: bool,
    /// The most recent health check passed.
    pub healthy: bool,
    pub health: ServerHealth,
    pub last_health_check_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    /// Launch identifier of the current process.
    pub instance_id: Option<String>,
    pub pid: Option<u32>,
    pub checks: u64,
    pub failed_checks: u64,
    pub restarts: u64,
    /// The server was asked to run and is watched by the health loop.
    pub tracked: bool,
}

impl Default for ManagedServerState {
    fn default() -> Self {
        Self {
            status: ServerStatus::NotStarted,
            running: false,
            healthy: false,
            health: ServerHealth::Unknown,
            last_health_check_time: None,
            error_message: None,
            started_at: None,
            instance_id: None,
            pid: None,
            checks: 0,
            failed_checks: 0,
            restarts: 0,
            tracked: false,
        }
    }
}

impl ManagedServerState {
    pub fn uptime_secs(&self) -> Option<f64> {
        let started = self.started_at?;
        if !self.running {
            return None;
        }
        Some((Utc::now() - started).num_milliseconds().max(0) as f64 / 1000.0)
    }

    pub fn error_rate(&self) -> f64 {
        if self.checks == 0 {
            0.0
        } else {
            self.failed_checks as f64 / self.checks as f64
        }
    }
}

/// What one health check did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckOutcome {
    Healthy,
    /// The check failed; `restarted` tells whether a restart was attempted.
    Unhealthy { restarted: bool },
    /// The breaker is open, nothing was checked.
    Skipped,
    /// The server is not being watched.
    NotTracked,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerMetrics {
    pub enabled: bool,
    pub status: ServerStatus,
    pub running: bool,
    pub healthy: bool,
    pub uptime_secs: Option<f64>,
    pub error_rate: f64,
    pub checks: u64,
    pub failed_checks: u64,
    pub restarts: u64,
    pub breaker: BreakerStatus,
    pub last_health_check_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Read-only fleet snapshot for dashboards and alerting.
#[derive(Debug, Clone, Serialize)]
pub struct FleetMetrics {
    pub configured: usize,
    pub enabled: usize,
    pub running: usize,
    pub healthy: usize,
    pub servers: BTreeMap<String, ServerMetrics>,
}
