use crate::error::Result;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Server health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerHealth {
    /// Last check passed
    Healthy,
    /// Last check failed
    Unhealthy,
    /// Not checked since the last launch
    Unknown,
}

/// Server monitor configuration
#[derive(Debug, Clone)]
pub struct ServerMonitorConfig {
    /// Pause between two full health passes
    pub check_interval: Duration,
}

impl Default for ServerMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
        }
    }
}

/// Background health loop.
///
/// Runs one sweep per interval until cancelled. The sweep receives the
/// cancellation token so it can stop between servers; a sweep that is
/// already running is allowed to finish.
pub struct ServerMonitor {
    config: ServerMonitorConfig,
    token: CancellationToken,
    monitor_task: Option<JoinHandle<()>>,
}

impl ServerMonitor {
    pub fn new(config: ServerMonitorConfig) -> Self {
        Self {
            config,
            token: CancellationToken::new(),
            monitor_task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.monitor_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Start the monitor. Starting a running monitor is a no-op.
    pub fn start<F, Fut>(&mut self, sweep: F) -> Result<()>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_running() {
            return Ok(());
        }

        self.token = CancellationToken::new();
        let token = self.token.clone();
        let interval = self.config.check_interval;

        let task = tokio::spawn(async move {
            tracing::info!(?interval, "Health monitor started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                sweep(token.clone()).await;
            }
            tracing::info!("Health monitor stopped");
        });

        self.monitor_task = Some(task);
        Ok(())
    }

    /// Stop the monitor and wait for the in-flight sweep to end
    pub async fn stop(&mut self) {
        self.token.cancel();
        if let Some(task) = self.monitor_task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Health monitor task ended abnormally");
            }
        }
    }
}

impl Drop for ServerMonitor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_sweeps_until_stopped() {
        let sweeps = Arc::new(AtomicUsize::new(0));
        let mut monitor = ServerMonitor::new(ServerMonitorConfig {
            check_interval: Duration::from_secs(10),
        });

        let counter = Arc::clone(&sweeps);
        monitor
            .start(move |_token| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(sweeps.load(Ordering::SeqCst), 3);

        monitor.stop().await;
        assert!(!monitor.is_running());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(sweeps.load(Ordering::SeqCst), 3);
    }
}
