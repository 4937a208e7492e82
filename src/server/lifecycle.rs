use crate::audit::{Details, HashChainLog, LogEntry};
use crate::breaker::{BreakerStatus, BreakerTransition};
use crate::error::Result;
use serde_json::json;
use std::sync::Arc;

/// Server lifecycle event types, each written to the audit chain under
/// its own action name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerLifecycleEvent {
    Started,
    StartFailed,
    /// A start request for a disabled server.
    StartRejected,
    Stopped,
    Restarted,
    /// The process exited on its own.
    Crashed,
    HealthChanged,
    BreakerOpened,
    BreakerHalfOpen,
    BreakerClosed,
    /// Operator override of a breaker.
    BreakerReset,
}

impl ServerLifecycleEvent {
    /// Audit action name.
    pub fn action(self) -> &'static str {
        match self {
            ServerLifecycleEvent::Started => "server_started",
            ServerLifecycleEvent::StartFailed => "server_start_failed",
            ServerLifecycleEvent::StartRejected => "server_start_rejected",
            ServerLifecycleEvent::Stopped => "server_stopped",
            ServerLifecycleEvent::Restarted => "server_restarted",
            ServerLifecycleEvent::Crashed => "server_crashed",
            ServerLifecycleEvent::HealthChanged => "server_health_changed",
            ServerLifecycleEvent::BreakerOpened => "circuit_breaker_opened",
            ServerLifecycleEvent::BreakerHalfOpen => "circuit_breaker_half_open",
            ServerLifecycleEvent::BreakerClosed => "circuit_breaker_closed",
            ServerLifecycleEvent::BreakerReset => "circuit_breaker_reset",
        }
    }

    pub fn from_transition(transition: BreakerTransition) -> Self {
        match transition.to {
            BreakerStatus::Open => ServerLifecycleEvent::BreakerOpened,
            BreakerStatus::HalfOpen => ServerLifecycleEvent::BreakerHalfOpen,
            BreakerStatus::Closed => ServerLifecycleEvent::BreakerClosed,
        }
    }
}

/// Writes server lifecycle events into the hash chain and reads them back.
pub struct ServerLifecycleManager {
    audit: Arc<HashChainLog>,
}

impl ServerLifecycleManager {
    pub fn new(audit: Arc<HashChainLog>) -> Self {
        Self { audit }
    }

    pub fn audit(&self) -> &Arc<HashChainLog> {
        &self.audit
    }

    /// Records a server event under `category`, tagging the details with the
    /// server name. Returns the entry hash.
    pub fn record_event(
        &self,
        name: &str,
        category: &str,
        event: ServerLifecycleEvent,
        mut details: Details,
    ) -> Result<String> {
        details.insert("server".to_string(), json!(name));
        tracing::debug!(server = %name, action = event.action(), "Recording lifecycle event");
        self.audit.append(event.action(), category, details)
    }

    /// Recent events for one server, newest first.
    pub fn get_server_events(&self, name: &str, limit: Option<usize>) -> Result<Vec<LogEntry>> {
        let mut events: Vec<LogEntry> = self
            .audit
            .entries(None, None)?
            .into_iter()
            .filter(|entry| entry.details.get("server").and_then(|v| v.as_str()) == Some(name))
            .collect();

        if let Some(limit) = limit {
            events.truncate(limit);
        }

        Ok(events)
    }
}
