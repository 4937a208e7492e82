use crate::breaker::BreakerConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Startup priority of a managed server.
///
/// Within a tier, servers start in the order `Critical`, `High`, `Medium`,
/// `Low`; the derived `Ord` follows that declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Priority {
    /// Numeric rank, lower starts first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }
}

/// Static description of one managed server.
///
/// Immutable after load; the orchestrator only ever reads it.
///
/// # Examples
///
/// ```
/// use fleet_runner::config::{Priority, ServerSpec};
///
/// let spec = ServerSpec {
///     command: "python3".to_string(),
///     args: vec!["-m".to_string(), "memory_server".to_string()],
///     port: Some(9101),
///     priority: Priority::Critical,
///     ..ServerSpec::default()
/// };
/// assert!(spec.enabled);
/// assert_eq!(spec.audit_category, "system");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Whether the server participates in `start_all` and may be started at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub priority: Priority,

    /// Startup tier, lower tiers start first.
    #[serde(default = "default_tier")]
    pub tier: u8,

    /// Command to execute, an absolute path or a command available in the PATH.
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// TCP port the server binds to. Servers without a port are health
    /// checked by liveness alone.
    #[serde(default)]
    pub port: Option<u16>,

    /// Category under which this server's lifecycle is audited.
    #[serde(default = "default_audit_category")]
    pub audit_category: String,

    /// Extra environment variables. The host/port/name overrides applied at
    /// launch always win over these.
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub features: HashMap<String, bool>,

    #[serde(default)]
    pub security: HashMap<String, Value>,

    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Default for ServerSpec {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            priority: Priority::default(),
            tier: default_tier(),
            command: String::new(),
            args: Vec::new(),
            port: None,
            audit_category: default_audit_category(),
            env: HashMap::new(),
            features: HashMap::new(),
            security: HashMap::new(),
            metadata: HashMap::new(),
        }
    }
}

impl ServerSpec {
    /// Whether a named feature flag is switched on.
    pub fn feature(&self, name: &str) -> bool {
        self.features.get(name).copied().unwrap_or(false)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_tier() -> u8 {
    1
}

fn default_audit_category() -> String {
    "system".to_string()
}

/// Orchestrator tuning shared by every managed server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Host handed to children and used for port probes.
    pub host: String,
    pub check_interval_secs: u64,
    pub probe_timeout_ms: u64,
    /// How long a freshly spawned child must survive to count as launched.
    pub launch_grace_ms: u64,
    pub stop_timeout_secs: u64,
    /// Wait after a force kill before giving up on reaping the child.
    pub kill_grace_ms: u64,
    pub breaker: BreakerConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            check_interval_secs: 30,
            probe_timeout_ms: 1000,
            launch_grace_ms: 500,
            stop_timeout_secs: 10,
            kill_grace_ms: 2000,
            breaker: BreakerConfig::default(),
        }
    }
}

impl Settings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn launch_grace(&self) -> Duration {
        Duration::from_millis(self.launch_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// The managed-server registry.
///
/// # JSON Schema
///
/// ```json
/// {
///   "servers": {
///     "memory": {
///       "priority": "critical",
///       "tier": 1,
///       "command": "python3",
///       "args": ["-m", "memory_server"],
///       "port": 9101,
///       "audit_category": "memory"
///     }
///   },
///   "settings": { "check_interval_secs": 15 }
/// }
/// ```
///
/// # Examples
///
/// ```no_run
/// use fleet_runner::config::Config;
///
/// let config = Config::from_file("fleet.json").unwrap();
/// for name in config.startup_order() {
///     println!("{}", name);
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Map of server names to their specs. The name is the unique key.
    pub servers: HashMap<String, ServerSpec>,

    #[serde(default)]
    pub settings: Settings,
}

impl Config {
    /// Loads a registry from a file path.
    ///
    /// Files ending in `.yaml` or `.yml` are parsed as YAML, everything
    /// else as JSON.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigParse` if the file cannot be read or does not
    /// conform to the schema.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read config file: {}", e)))?;

        if is_yaml(path) {
            Self::parse_from_yaml(&content)
        } else {
            Self::parse_from_str(&content)
        }
    }

    /// Parses a registry from a JSON string.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON config: {}", e)))
    }

    /// Parses a registry from a YAML string.
    pub fn parse_from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse YAML config: {}", e)))
    }

    /// Names of the enabled servers in startup order.
    ///
    /// Sorted ascending by `(tier, priority rank)`, with the server name as
    /// the final tie-break so the order is stable for a fixed registry.
    pub fn startup_order(&self) -> Vec<String> {
        let mut enabled: Vec<(&String, &ServerSpec)> =
            self.servers.iter().filter(|(_, spec)| spec.enabled).collect();
        enabled.sort_by(|(a_name, a), (b_name, b)| {
            (a.tier, a.priority.rank(), a_name.as_str()).cmp(&(
                b.tier,
                b.priority.rank(),
                b_name.as_str(),
            ))
        });
        enabled.into_iter().map(|(name, _)| name.clone()).collect()
    }
}

/// Several named registries kept side by side, e.g. `internal` and
/// `external`. Which one to run is the caller's decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileSet {
    pub profiles: HashMap<String, Config>,
}

impl ProfileSet {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read profile file: {}", e)))?;

        if is_yaml(path) {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::ConfigParse(format!("Failed to parse YAML profiles: {}", e)))
        } else {
            Self::parse_from_str(&content)
        }
    }

    pub fn parse_from_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON profiles: {}", e)))
    }

    /// Takes a copy of the named profile.
    pub fn select(&self, name: &str) -> Result<Config> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ConfigParse(format!("Unknown configuration profile '{}'", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}
