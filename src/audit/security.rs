use chrono::{SecondsFormat, Utc};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Human-readable security event stream kept beside the hash chain.
///
/// Lines are not chained and writing them is best effort: a failure here is
/// logged and otherwise ignored.
#[derive(Debug, Clone)]
pub struct SecurityEvents {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl SecurityEvents {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, severity: Severity, event: &str, message: &str) {
        match severity {
            Severity::Info => tracing::info!(target: "security", event, "{}", message),
            Severity::Warning => tracing::warn!(target: "security", event, "{}", message),
            Severity::Critical => tracing::error!(target: "security", event, "{}", message),
        }

        let line = format!(
            "{} [{}] {}: {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            severity,
            event,
            message
        );

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = written {
            tracing::debug!(path = ?self.path, error = %e, "Failed to write security event");
        }
    }

    /// Last `limit` lines of the stream, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<String> {
        let content = std::fs::read_to_string(&self.path).unwrap_or_default();
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(limit);
        lines[start..].iter().map(|l| l.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let events = SecurityEvents::new(dir.path().join("security_events.log"));
        events.record(Severity::Warning, "setxattr failed", "not supported");
        events.record(Severity::Critical, "audit_repair_failed", "disk full");

        let lines = events.recent(10);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[WARNING] setxattr failed: not supported"));
        assert!(lines[1].contains("[CRITICAL]"));
        assert_eq!(events.recent(1).len(), 1);
    }

    #[test]
    fn test_unwritable_stream_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let events = SecurityEvents::new(dir.path().join("missing").join("events.log"));
        events.record(Severity::Info, "probe", "still fine");
        assert!(events.recent(5).is_empty());
    }
}
