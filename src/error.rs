/// Error handling module for Fleet Runner.
///
/// This module defines the error types used throughout the library.
/// Failures that the orchestrator recovers from locally (a server that
/// will not launch, a probe that times out) are recorded and reported
/// through return values; only the conditions below reach the caller.
///
/// # Example
///
/// ```
/// use fleet_runner::error::{Error, Result};
///
/// fn handle_error(result: Result<()>) {
///     match result {
///         Ok(_) => println!("Operation succeeded"),
///         Err(Error::ServerNotFound(name)) => println!("Server '{}' is not configured", name),
///         Err(Error::ChainWrite(msg)) => println!("Audit write failed: {}", msg),
///         Err(e) => println!("Other error: {}", e),
///     }
/// }
/// ```
use thiserror::Error;

/// Errors that can occur in the fleet-runner library.
///
/// Note that an open circuit breaker is deliberately absent: a suppressed
/// call is reported as `CallOutcome::Skipped` or `HealthCheckOutcome::Skipped`,
/// never as an error.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to read or parse the server registry.
    ///
    /// This error occurs when:
    /// - The configuration file cannot be read
    /// - The document is malformed JSON or YAML
    /// - A requested configuration profile does not exist
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// The registry parsed but contains values that fail validation.
    ///
    /// This error occurs when:
    /// - No servers are configured
    /// - A command or audit category is empty
    /// - Two enabled servers claim the same port
    /// - Health or breaker settings are zero or inconsistent
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Requested server was not found in the registry.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// A managed server could not be launched.
    ///
    /// This error occurs when:
    /// - The command does not exist or is not executable
    /// - The process exits during its startup grace period
    #[error("Launch failed: {0}")]
    Launch(String),

    /// Error while signalling or reaping a running server process.
    #[error("Server process error: {0}")]
    Process(String),

    /// A liveness or port-reachability probe failed.
    #[error("Probe failed: {0}")]
    Probe(String),

    /// Operation timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An entry could not be appended to the hash-chain log.
    ///
    /// The in-memory chain tail is left untouched, so retrying the append
    /// does not fork the chain.
    #[error("Audit chain write failed: {0}")]
    ChainWrite(String),

    /// Repairing a corrupted hash-chain log failed.
    ///
    /// The pre-repair file is preserved as a byte-identical backup.
    #[error("Audit chain repair failed: {0}")]
    ChainRepair(String),

    /// Error in serializing or deserializing data.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Underlying filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type for fleet-runner operations.
pub type Result<T> = std::result::Result<T, Error>;
