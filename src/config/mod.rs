//! Configuration module for Fleet Runner.
//!
//! This module holds the managed-server registry: one `ServerSpec` per
//! supervised subprocess plus the orchestrator `Settings`. Registries are
//! loaded from JSON or YAML and several of them may live side by side in a
//! `ProfileSet`.
//!
//! # Examples
//!
//! Loading a registry from a file:
//!
//! ```no_run
//! use fleet_runner::config::{validate_config, Config};
//!
//! let config = Config::from_file("fleet.json").unwrap();
//! validate_config(&config).unwrap();
//! println!("Loaded registry with {} servers", config.servers.len());
//! ```
//!
//! Building a registry programmatically:
//!
//! ```
//! use fleet_runner::config::{Config, Priority, ServerSpec};
//!
//! let mut config = Config::default();
//! config.servers.insert(
//!     "compression".to_string(),
//!     ServerSpec {
//!         command: "compression-server".to_string(),
//!         port: Some(9102),
//!         priority: Priority::High,
//!         ..ServerSpec::default()
//!     },
//! );
//! assert_eq!(config.startup_order(), vec!["compression"]);
//! ```
mod parser;
pub mod validator;

pub use parser::{Config, Priority, ProfileSet, ServerSpec, Settings};
pub use validator::validate_config;
