use super::entry::{ChainPointer, Details, GENESIS_HASH, LogEntry, RESET_MARKER, details};
use super::integrity::FileIntegrity;
use super::security::{SecurityEvents, Severity};
use crate::error::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Options for opening a `HashChainLog`.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Name of the entry file inside the log directory.
    pub file_name: String,
    /// Repair automatically when the chain fails verification on open.
    pub auto_repair: bool,
    /// Append an `audit_system_initialized` entry on open.
    pub log_initialization: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            file_name: "audit.jsonl".to_string(),
            auto_repair: true,
            log_initialization: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionReason {
    /// The line is not a parseable entry.
    Malformed,
    /// `current_hash` does not match the entry's fields.
    HashMismatch,
    /// `prev_hash` does not match the preceding entry.
    BrokenLink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptedEntry {
    /// Zero-based position among the non-empty lines of the file.
    pub index: usize,
    pub action: Option<String>,
    pub reason: CorruptionReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub valid: bool,
    pub events_verified: usize,
    pub corrupted_events: Vec<CorruptedEntry>,
    /// Reset entries whose link did not match the preceding entry. These are
    /// permitted and do not make the chain invalid.
    pub authorized_resets: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub repaired: bool,
    /// Entries kept in the rewritten file.
    pub events_repaired: usize,
    pub events_removed: usize,
    pub backup_path: Option<PathBuf>,
}

struct ChainTail {
    last_hash: String,
}

/// Append-only, hash-chained audit log backed by a JSON-lines file.
///
/// Every entry's `current_hash` covers its own fields and the previous
/// entry's hash. One writer lock serializes appends, verification and
/// repair; the chain tail only advances once an entry is on disk.
///
/// # Examples
///
/// ```no_run
/// use fleet_runner::audit::{details, HashChainLog, LogOptions};
/// use serde_json::json;
///
/// let log = HashChainLog::open("/var/lib/fleet/audit", LogOptions::default()).unwrap();
/// log.append("server_started", "system", details([("port", json!(9101))])).unwrap();
/// assert!(log.verify().unwrap().valid);
/// ```
pub struct HashChainLog {
    dir: PathBuf,
    log_path: PathBuf,
    pointer_path: PathBuf,
    tail: Mutex<ChainTail>,
    security: SecurityEvents,
    integrity: FileIntegrity,
}

impl HashChainLog {
    /// Opens (or creates) the log in `dir`.
    ///
    /// An existing log is verified first; a broken chain is repaired when
    /// `auto_repair` is set and the recovery is then appended as an entry of
    /// its own.
    #[tracing::instrument(skip(dir, options), fields(dir = ?dir.as_ref()))]
    pub fn open(dir: impl AsRef<Path>, options: LogOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let log_path = dir.join(&options.file_name);
        let stem = Path::new(&options.file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("audit")
            .to_string();
        let pointer_path = dir.join(format!("{}.pointer.json", stem));
        let security = SecurityEvents::new(dir.join("security_events.log"));
        let integrity = FileIntegrity::new(security.clone());

        let log = Self {
            dir,
            log_path,
            pointer_path,
            tail: Mutex::new(ChainTail {
                last_hash: GENESIS_HASH.to_string(),
            }),
            security,
            integrity,
        };

        let resumed_from = log.load_tail()?;
        log.recover_on_open(&options)?;

        if options.log_initialization {
            log.append(
                RESET_MARKER,
                "system",
                details([
                    ("log_path", json!(log.log_path.display().to_string())),
                    ("pid", json!(std::process::id())),
                    ("resumed_from", json!(resumed_from)),
                ]),
            )?;
        }

        tracing::info!(path = ?log.log_path, "Audit log opened");
        Ok(log)
    }

    fn lock(&self) -> MutexGuard<'_, ChainTail> {
        self.tail.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Picks the resume hash: last entry in the file, then the pointer, then genesis.
    fn load_tail(&self) -> Result<&'static str> {
        let mut tail = self.lock();

        if let Some(last) = self.read_lines()?.last() {
            if let Ok(entry) = serde_json::from_str::<LogEntry>(last) {
                tail.last_hash = entry.current_hash;
                return Ok("log");
            }
        }

        if let Some(pointer) = self.read_pointer()? {
            tail.last_hash = pointer.last_hash;
            return Ok("pointer");
        }

        tail.last_hash = GENESIS_HASH.to_string();
        Ok("genesis")
    }

    fn recover_on_open(&self, options: &LogOptions) -> Result<()> {
        if !self.log_path.exists() {
            return Ok(());
        }

        let report = self.verify()?;
        if report.valid {
            tracing::debug!(events = report.events_verified, "Audit chain verified");
            return Ok(());
        }

        self.security.record(
            Severity::Warning,
            "audit_chain_corrupted",
            &format!(
                "{} corrupted entries in {}",
                report.corrupted_events.len(),
                self.log_path.display()
            ),
        );

        if !options.auto_repair {
            tracing::warn!(
                corrupted = report.corrupted_events.len(),
                "Audit chain is corrupted and auto-repair is disabled"
            );
            return Ok(());
        }

        let repair = self.repair()?;
        self.append(
            "audit_chain_recovered",
            "security",
            details([
                ("backup_path", json!(repair.backup_path)),
                ("corrupted_events", json!(report.corrupted_events)),
                ("events_removed", json!(repair.events_removed)),
                ("events_repaired", json!(repair.events_repaired)),
            ]),
        )?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn pointer_path(&self) -> &Path {
        &self.pointer_path
    }

    pub fn security(&self) -> &SecurityEvents {
        &self.security
    }

    pub fn integrity(&self) -> &FileIntegrity {
        &self.integrity
    }

    /// Hash of the most recent entry, or the genesis sentinel.
    pub fn last_hash(&self) -> String {
        self.lock().last_hash.clone()
    }

    /// Appends an entry chained to the current tail and returns its hash.
    ///
    /// # Errors
    ///
    /// Returns `Error::ChainWrite` if the entry could not be written; the
    /// tail is left where it was.
    pub fn append(&self, action: &str, category: &str, details: Details) -> Result<String> {
        let mut tail = self.lock();
        let prev = tail.last_hash.clone();
        self.append_locked(&mut tail, action, category, details, prev)
    }

    /// Appends an explicit reset: an `audit_system_initialized` entry whose
    /// `prev_hash` is the genesis sentinel.
    pub fn append_reset(&self, reason: &str) -> Result<String> {
        let mut tail = self.lock();
        let previous = tail.last_hash.clone();
        self.append_locked(
            &mut tail,
            RESET_MARKER,
            "system",
            details([
                ("previous_hash", json!(previous)),
                ("reason", json!(reason)),
            ]),
            GENESIS_HASH.to_string(),
        )
    }

    fn append_locked(
        &self,
        tail: &mut ChainTail,
        action: &str,
        category: &str,
        details: Details,
        prev_hash: String,
    ) -> Result<String> {
        let entry = LogEntry::new(action, category, details, prev_hash)
            .map_err(|e| Error::ChainWrite(e.to_string()))?;
        let mut line = serde_json::to_string(&entry).map_err(|e| Error::ChainWrite(e.to_string()))?;
        line.push('\n');

        self.write_line(action, line.as_bytes()).map_err(|e| {
            tracing::error!(action, error = %e, "Failed to append audit entry");
            Error::ChainWrite(format!("{}: {}", self.log_path.display(), e))
        })?;

        tail.last_hash = entry.current_hash.clone();
        self.store_pointer(&entry.current_hash);

        tracing::trace!(action, category, hash = %entry.current_hash, "Audit entry appended");
        Ok(entry.current_hash)
    }

    /// Writes one full line. A fragment left by an earlier failed write is cut
    /// off first, and a failed write is truncated back, so every line on disk
    /// is either whole or absent.
    fn write_line(&self, action: &str, line: &[u8]) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.log_path)?;

        let mut len = file.metadata()?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                let raw = fs::read(&self.log_path)?;
                let keep = raw
                    .iter()
                    .rposition(|b| *b == b'\n')
                    .map_or(0, |i| i + 1);
                let dropped = raw.len() - keep;
                file.set_len(keep as u64)?;
                len = keep as u64;
                tracing::warn!(action, dropped, "Truncated torn audit line before append");
                self.security.record(
                    Severity::Warning,
                    "audit_torn_write_truncated",
                    &format!("dropped {} trailing bytes from {}", dropped, self.log_path.display()),
                );
            }
        }

        let written = file.write_all(line).and_then(|_| file.sync_data());
        if written.is_err() {
            let _ = file.set_len(len);
        }
        written
    }

    /// Best effort: the pointer is rebuilt from the log on the next open.
    fn store_pointer(&self, last_hash: &str) {
        let pointer = ChainPointer::new(last_hash);
        let tmp = self.pointer_path.with_extension("json.tmp");
        let written = serde_json::to_vec(&pointer)
            .map_err(std::io::Error::other)
            .and_then(|bytes| fs::write(&tmp, bytes))
            .and_then(|_| fs::rename(&tmp, &self.pointer_path));

        if let Err(e) = written {
            tracing::warn!(path = ?self.pointer_path, error = %e, "Failed to update chain pointer");
            self.security.record(
                Severity::Warning,
                "chain_pointer_write_failed",
                &e.to_string(),
            );
        }
    }

    pub fn read_pointer(&self) -> Result<Option<ChainPointer>> {
        match fs::read(&self.pointer_path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Non-empty lines of the log file; a missing file has none.
    fn read_lines(&self) -> Result<Vec<String>> {
        let raw = match fs::read(&self.log_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(split_lines(&raw))
    }

    /// Walks the whole chain, recomputing every hash and checking every link.
    pub fn verify(&self) -> Result<VerifyReport> {
        let _tail = self.lock();
        let lines = self.read_lines()?;

        let mut expected_prev = GENESIS_HASH.to_string();
        let mut events_verified = 0;
        let mut corrupted_events = Vec::new();
        let mut authorized_resets = Vec::new();

        for (index, line) in lines.iter().enumerate() {
            let entry = match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => entry,
                Err(_) => {
                    corrupted_events.push(CorruptedEntry {
                        index,
                        action: None,
                        reason: CorruptionReason::Malformed,
                    });
                    continue;
                }
            };

            let recomputed = entry.recompute_hash().unwrap_or_default();
            let hash_ok = recomputed == entry.current_hash;
            let link_ok = entry.prev_hash == expected_prev || entry.is_explicit_reset();

            if !hash_ok {
                corrupted_events.push(CorruptedEntry {
                    index,
                    action: Some(entry.action.clone()),
                    reason: CorruptionReason::HashMismatch,
                });
                // The successor points at the stored hash, which no longer
                // describes this entry, so it is reported as well.
                expected_prev = recomputed;
                continue;
            }

            if !link_ok {
                if entry.is_reset() {
                    authorized_resets.push(index);
                } else {
                    corrupted_events.push(CorruptedEntry {
                        index,
                        action: Some(entry.action.clone()),
                        reason: CorruptionReason::BrokenLink,
                    });
                    expected_prev = entry.current_hash;
                    continue;
                }
            }

            events_verified += 1;
            expected_prev = entry.current_hash;
        }

        Ok(VerifyReport {
            valid: corrupted_events.is_empty(),
            events_verified,
            corrupted_events,
            authorized_resets,
        })
    }

    /// Drops every entry that does not chain onto the last kept entry.
    ///
    /// The raw file is copied to a timestamped backup before anything is
    /// touched, and the new content is written to a temporary file and
    /// renamed into place. On failure the backup is restored.
    #[tracing::instrument(skip(self), fields(path = ?self.log_path))]
    pub fn repair(&self) -> Result<RepairReport> {
        let mut tail = self.lock();

        let raw = match fs::read(&self.log_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RepairReport {
                    repaired: true,
                    events_repaired: 0,
                    events_removed: 0,
                    backup_path: None,
                });
            }
            Err(e) => return Err(Error::ChainRepair(format!("Failed to read log: {}", e))),
        };

        let backup_path = self.backup_path();
        fs::write(&backup_path, &raw).map_err(|e| {
            self.repair_failed(&format!("Failed to write backup {}: {}", backup_path.display(), e))
        })?;

        let mut kept: Vec<String> = Vec::new();
        let mut last_kept = GENESIS_HASH.to_string();
        let mut removed = 0;

        for line in split_lines(&raw) {
            let keep = match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) if entry.hash_is_valid() => {
                    if entry.prev_hash == last_kept || entry.is_reset() {
                        last_kept = entry.current_hash.clone();
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            };

            if keep {
                kept.push(line);
            } else {
                removed += 1;
            }
        }

        if let Err(e) = self.rewrite(&kept) {
            if let Err(restore) = fs::copy(&backup_path, &self.log_path) {
                tracing::error!(error = %restore, backup = ?backup_path, "Failed to restore audit log backup");
            }
            return Err(self.repair_failed(&format!(
                "Failed to rewrite log, original kept at {}: {}",
                backup_path.display(),
                e
            )));
        }

        tail.last_hash = last_kept.clone();
        self.store_pointer(&last_kept);

        tracing::warn!(
            kept = kept.len(),
            removed,
            backup = ?backup_path,
            "Audit chain repaired"
        );
        self.security.record(
            Severity::Warning,
            "audit_chain_repaired",
            &format!(
                "kept {} entries, removed {}, backup at {}",
                kept.len(),
                removed,
                backup_path.display()
            ),
        );

        Ok(RepairReport {
            repaired: true,
            events_repaired: kept.len(),
            events_removed: removed,
            backup_path: Some(backup_path),
        })
    }

    fn rewrite(&self, lines: &[String]) -> std::io::Result<()> {
        let tmp = self.log_path.with_extension("repair.tmp");
        let result = (|| {
            let mut file = fs::File::create(&tmp)?;
            for line in lines {
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }
            file.sync_all()?;
            fs::rename(&tmp, &self.log_path)
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    fn repair_failed(&self, message: &str) -> Error {
        tracing::error!(message, "CRITICAL: audit chain repair failed");
        self.security
            .record(Severity::Critical, "audit_repair_failed", message);
        Error::ChainRepair(message.to_string())
    }

    fn backup_path(&self) -> PathBuf {
        let file_name = self
            .log_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audit.jsonl");
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6f");
        self.dir.join(format!("{}.backup-{}", file_name, stamp))
    }

    /// Reads entries back, newest first.
    ///
    /// Malformed lines are skipped. `category` filters, `limit` truncates
    /// after filtering.
    pub fn entries(&self, category: Option<&str>, limit: Option<usize>) -> Result<Vec<LogEntry>> {
        let lines = {
            let _tail = self.lock();
            self.read_lines()?
        };

        let mut entries: Vec<LogEntry> = lines
            .iter()
            .rev()
            .filter_map(|line| serde_json::from_str::<LogEntry>(line).ok())
            .filter(|entry| category.is_none_or(|c| entry.category == c))
            .collect();

        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }
}

fn split_lines(raw: &[u8]) -> Vec<String> {
    raw.split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> LogOptions {
        LogOptions {
            log_initialization: false,
            ..LogOptions::default()
        }
    }

    #[test]
    fn test_first_entry_links_to_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let log = HashChainLog::open(dir.path(), quiet()).unwrap();
        log.append("server_started", "system", Details::new()).unwrap();

        let entries = log.entries(None, None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
        assert_eq!(log.read_pointer().unwrap().unwrap().last_hash, entries[0].current_hash);
    }

    #[test]
    fn test_initialization_entry_continues_chain() {
        let dir = tempfile::tempdir().unwrap();
        let tail = {
            let log = HashChainLog::open(dir.path(), quiet()).unwrap();
            log.append("a", "system", Details::new()).unwrap()
        };

        let log = HashChainLog::open(dir.path(), LogOptions::default()).unwrap();
        let newest = &log.entries(None, Some(1)).unwrap()[0];
        assert_eq!(newest.action, RESET_MARKER);
        assert_eq!(newest.prev_hash, tail);
        assert!(log.verify().unwrap().valid);
    }

    #[test]
    fn test_split_lines_skips_blank() {
        let lines = split_lines(b"a\n\n  \nb\n");
        assert_eq!(lines, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_entries_filter_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let log = HashChainLog::open(dir.path(), quiet()).unwrap();
        log.append("one", "system", Details::new()).unwrap();
        log.append("two", "security", Details::new()).unwrap();
        log.append("three", "system", Details::new()).unwrap();

        let system = log.entries(Some("system"), None).unwrap();
        assert_eq!(
            system.iter().map(|e| e.action.as_str()).collect::<Vec<_>>(),
            vec!["three", "one"]
        );
        assert_eq!(log.entries(None, Some(2)).unwrap().len(), 2);
    }
}
