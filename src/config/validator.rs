use crate::config::{Config, ServerSpec, Settings};
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Validates a single server spec
pub fn validate_server_spec(name: &str, spec: &ServerSpec) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::ConfigInvalid("Server name must not be empty".to_string()));
    }

    if spec.command.trim().is_empty() {
        return Err(Error::ConfigInvalid(format!("Server '{}' has empty command", name)));
    }

    if spec.audit_category.trim().is_empty() {
        return Err(Error::ConfigInvalid(format!(
            "Server '{}' has empty audit category",
            name
        )));
    }

    if spec.port == Some(0) {
        return Err(Error::ConfigInvalid(format!("Server '{}' has port 0", name)));
    }

    Ok(())
}

/// Validates a map of server specs, including port clashes between enabled servers
pub fn validate_server_specs(servers: &HashMap<String, ServerSpec>) -> Result<()> {
    if servers.is_empty() {
        return Err(Error::ConfigInvalid("No servers configured".to_string()));
    }

    let mut ports: HashMap<u16, &str> = HashMap::new();
    let mut names: Vec<&String> = servers.keys().collect();
    names.sort();

    for name in names {
        let spec = &servers[name];
        validate_server_spec(name, spec)?;

        if let (true, Some(port)) = (spec.enabled, spec.port) {
            if let Some(other) = ports.insert(port, name) {
                return Err(Error::ConfigInvalid(format!(
                    "Servers '{}' and '{}' both claim port {}",
                    other, name, port
                )));
            }
        }
    }

    Ok(())
}

/// Validates orchestrator and breaker settings
pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.host.trim().is_empty() {
        return Err(Error::ConfigInvalid("Host must not be empty".to_string()));
    }
    if settings.check_interval_secs == 0 {
        return Err(Error::ConfigInvalid("check_interval_secs must be positive".to_string()));
    }
    if settings.probe_timeout_ms == 0 {
        return Err(Error::ConfigInvalid("probe_timeout_ms must be positive".to_string()));
    }

    let breaker = &settings.breaker;
    if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
        return Err(Error::ConfigInvalid(
            "Breaker thresholds must be positive".to_string(),
        ));
    }
    if (breaker.window_size as u64) < u64::from(breaker.failure_threshold) {
        return Err(Error::ConfigInvalid(format!(
            "Breaker window_size {} is smaller than failure_threshold {}",
            breaker.window_size, breaker.failure_threshold
        )));
    }

    Ok(())
}

/// Full configuration validation
pub fn validate_config(config: &Config) -> Result<()> {
    validate_server_specs(&config.servers)?;
    validate_settings(&config.settings)?;

    Ok(())
}
