use anyhow::Context;
use fleet_runner::Orchestrator;
use fleet_runner::audit::{HashChainLog, LogOptions};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG=fleet_runner=debug,security=info for the full picture
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "demos/fleet.json".to_string());
    let audit_dir = args.next().unwrap_or_else(|| "target/fleet-audit".to_string());

    tracing::info!(%config_path, %audit_dir, "Starting fleet demo");

    let audit = Arc::new(
        HashChainLog::open(&audit_dir, LogOptions::default())
            .with_context(|| format!("opening audit chain in {}", audit_dir))?,
    );
    let orchestrator = Orchestrator::from_config_file(&config_path, Arc::clone(&audit))
        .context("loading fleet registry")?;

    let started = orchestrator.start_all().await?;
    for (name, ok) in &started {
        println!("{:<12} {}", name, if *ok { "started" } else { "FAILED" });
    }

    orchestrator.start_monitoring().await?;
    println!("Monitoring fleet, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    let metrics = orchestrator.metrics();
    println!("{}", serde_json::to_string_pretty(&metrics)?);

    orchestrator.shutdown().await?;

    let report = audit.verify()?;
    println!(
        "Audit chain: {} entries verified, valid = {}",
        report.events_verified, report.valid
    );
    Ok(())
}
