/*!
 # Fleet Runner

 A Rust library for supervising a fleet of local server processes.

 ## Overview

 Fleet Runner provides functionality to:
 - Start managed servers in tier/priority order and stop them again
 - Health check every server in a background loop and restart crashed ones
 - Stop restarting a server that keeps failing, using a per-server circuit breaker
 - Record every lifecycle transition in a tamper-evident, hash-chained audit log
 - Detect and repair a corrupted audit log on startup

 ## Basic Usage

 ```no_run
 use fleet_runner::audit::{HashChainLog, LogOptions};
 use fleet_runner::{Orchestrator, Result};
 use std::sync::Arc;
 use std::time::Duration;

 #[tokio::main]
 async fn main() -> Result<()> {
     // Open (and verify) the audit chain
     let audit = Arc::new(HashChainLog::open("audit", LogOptions::default())?);

     // Create an orchestrator from a registry file
     let orchestrator = Orchestrator::from_config_file("fleet.json", Arc::clone(&audit))?;

     // Start all enabled servers
     let results = orchestrator.start_all().await?;
     println!("Started: {:?}", results);

     // Or restart one of them
     orchestrator.restart("memory").await?;

     // Watch the fleet in the background
     orchestrator.start_monitoring().await?;

     // Check the chain at any time
     let report = audit.verify()?;
     assert!(report.valid);

     orchestrator.stop("memory", Duration::from_secs(10)).await?;
     orchestrator.shutdown().await?;
     Ok(())
 }
 ```

 ## Features

 - **Ordered startup**: Tiers first, then `critical`, `high`, `medium`, `low`
 - **Self-healing**: Crashed servers are restarted while their breaker stays closed
 - **Circuit breakers**: Trailing-window breakers suppress restart storms
 - **Audit chain**: SHA-256 linked JSON lines with verify, repair and pointer recovery
 - **Configuration**: JSON or YAML registries, with optional named profiles
 - **Async Support**: Full async/await support on tokio
*/

pub mod audit;
pub mod breaker;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod server;

pub use audit::{HashChainLog, LogOptions};
pub use breaker::{BreakerConfig, BreakerStatus, CallOutcome, CircuitBreaker};
pub use config::{Config, Priority, ServerSpec};
pub use error::{Error, Result};
pub use orchestrator::{FleetMetrics, HealthCheckOutcome, Orchestrator};
pub use server::{ServerId, ServerProcess, ServerStatus};
