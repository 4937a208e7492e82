use fleet_runner::audit::{
    CorruptionReason, Details, GENESIS_HASH, HashChainLog, IntegrityStatus, LogEntry, LogOptions,
    RESET_MARKER, details,
};
use fleet_runner::error::{Error, Result};
use serde_json::json;
use std::fs;
use std::path::Path;

fn quiet() -> LogOptions {
    LogOptions {
        log_initialization: false,
        ..LogOptions::default()
    }
}

/// Appends `count` server events with distinct ports and returns their hashes.
fn fill(log: &HashChainLog, count: usize) -> Result<Vec<String>> {
    (0..count)
        .map(|i| {
            log.append(
                "server_started",
                "system",
                details([
                    ("port", json!(9100 + i)),
                    ("server", json!(format!("server-{}", i))),
                ]),
            )
        })
        .collect()
}

fn lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

fn write_lines(path: &Path, lines: &[String]) {
    let mut content = lines.join("\n");
    content.push('\n');
    fs::write(path, content).unwrap();
}

/// Rewrites the port recorded in entry `index` without touching its hash.
fn tamper_port(path: &Path, index: usize) {
    let mut all = lines(path);
    let original = format!("\"port\":{}", 9100 + index);
    assert!(all[index].contains(&original));
    all[index] = all[index].replace(&original, "\"port\":31337");
    write_lines(path, &all);
}

#[test]
fn test_fresh_chain_is_valid() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = HashChainLog::open(dir.path(), LogOptions::default())?;
    let hashes = fill(&log, 5)?;

    let report = log.verify()?;
    assert!(report.valid);
    // Initialization entry plus five events
    assert_eq!(report.events_verified, 6);
    assert!(report.corrupted_events.is_empty());
    assert!(report.authorized_resets.is_empty());

    let entries = log.entries(None, None)?;
    assert_eq!(entries.last().unwrap().action, RESET_MARKER);
    assert_eq!(entries.last().unwrap().prev_hash, GENESIS_HASH);
    assert_eq!(log.last_hash(), hashes[4]);
    assert_eq!(log.read_pointer()?.unwrap().last_hash, hashes[4]);

    // Every entry links to its predecessor
    let oldest_first: Vec<&LogEntry> = entries.iter().rev().collect();
    for pair in oldest_first.windows(2) {
        assert_eq!(pair[1].prev_hash, pair[0].current_hash);
        assert!(pair[1].hash_is_valid());
    }

    Ok(())
}

#[test]
fn test_tampered_entry_detected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = HashChainLog::open(dir.path(), quiet())?;
    fill(&log, 5)?;

    tamper_port(log.log_path(), 2);

    let report = log.verify()?;
    assert!(!report.valid);

    let flagged: Vec<(usize, CorruptionReason)> = report
        .corrupted_events
        .iter()
        .map(|c| (c.index, c.reason))
        .collect();
    assert_eq!(
        flagged,
        vec![
            (2, CorruptionReason::HashMismatch),
            (3, CorruptionReason::BrokenLink),
        ]
    );
    assert_eq!(report.corrupted_events[0].action.as_deref(), Some("server_started"));

    Ok(())
}

#[test]
fn test_repair_keeps_valid_prefix() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = HashChainLog::open(dir.path(), quiet())?;
    let hashes = fill(&log, 6)?;

    tamper_port(log.log_path(), 3);
    let tampered = fs::read(log.log_path())?;

    let report = log.repair()?;
    assert!(report.repaired);
    assert_eq!(report.events_repaired, 3);
    assert_eq!(report.events_removed, 3);

    let backup = report.backup_path.expect("backup written");
    assert!(
        backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("audit.jsonl.backup-")
    );
    assert_eq!(fs::read(&backup)?, tampered);

    assert_eq!(lines(log.log_path()).len(), 3);
    assert_eq!(log.read_pointer()?.unwrap().last_hash, hashes[2]);
    assert_eq!(log.last_hash(), hashes[2]);

    let verified = log.verify()?;
    assert!(verified.valid);
    assert_eq!(verified.events_verified, 3);

    // New entries chain onto the repaired tail
    let next = log.append("server_stopped", "system", Details::new())?;
    assert_eq!(log.entries(None, Some(1))?[0].prev_hash, hashes[2]);
    assert_eq!(log.last_hash(), next);
    assert!(log.verify()?.valid);

    Ok(())
}

#[test]
fn test_malformed_line_is_corruption() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = HashChainLog::open(dir.path(), quiet())?;
    fill(&log, 2)?;

    let mut all = lines(log.log_path());
    all.insert(1, "{ not json".to_string());
    write_lines(log.log_path(), &all);

    let report = log.verify()?;
    assert!(!report.valid);
    assert_eq!(report.corrupted_events.len(), 1);
    assert_eq!(report.corrupted_events[0].index, 1);
    assert_eq!(report.corrupted_events[0].reason, CorruptionReason::Malformed);
    assert!(report.corrupted_events[0].action.is_none());
    assert_eq!(report.events_verified, 2);

    let repaired = log.repair()?;
    assert_eq!(repaired.events_removed, 1);
    assert!(log.verify()?.valid);

    Ok(())
}

#[test]
fn test_unknown_or_missing_fields_are_malformed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = HashChainLog::open(dir.path(), quiet())?;
    let hashes = fill(&log, 3)?;

    // An extra key outside the hashed fields
    let mut all = lines(log.log_path());
    all[2] = all[2].replacen('{', "{\"approved_by\":\"mallory\",", 1);
    write_lines(log.log_path(), &all);

    let report = log.verify()?;
    assert!(!report.valid);
    assert_eq!(report.corrupted_events.len(), 1);
    assert_eq!(report.corrupted_events[0].index, 2);
    assert_eq!(report.corrupted_events[0].reason, CorruptionReason::Malformed);

    assert_eq!(log.repair()?.events_removed, 1);
    assert!(log.verify()?.valid);
    assert_eq!(log.last_hash(), hashes[1]);

    // The details key stripped out entirely
    log.append("server_stopped", "system", details([("port", json!(9200))]))?;
    let mut all = lines(log.log_path());
    let start = all[2].find("\"details\":{").unwrap();
    let end = start + all[2][start..].find("},").unwrap() + 2;
    all[2].replace_range(start..end, "");
    write_lines(log.log_path(), &all);

    let report = log.verify()?;
    assert!(!report.valid);
    assert_eq!(report.corrupted_events[0].index, 2);
    assert_eq!(report.corrupted_events[0].reason, CorruptionReason::Malformed);

    Ok(())
}

#[test]
fn test_deleted_entry_breaks_chain() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = HashChainLog::open(dir.path(), quiet())?;
    fill(&log, 4)?;

    let mut all = lines(log.log_path());
    all.remove(1);
    write_lines(log.log_path(), &all);

    let report = log.verify()?;
    assert!(!report.valid);
    assert_eq!(report.corrupted_events.len(), 1);
    assert_eq!(report.corrupted_events[0].index, 1);
    assert_eq!(report.corrupted_events[0].reason, CorruptionReason::BrokenLink);

    Ok(())
}

#[test]
fn test_reset_entries_are_authorized() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = HashChainLog::open(dir.path(), quiet())?;
    fill(&log, 2)?;

    // Explicit reset restarts the chain from the sentinel
    log.append_reset("operator requested")?;
    fill(&log, 1)?;
    let report = log.verify()?;
    assert!(report.valid);
    assert!(report.authorized_resets.is_empty());
    assert_eq!(report.events_verified, 4);

    // A reset-family entry pointing somewhere unexpected is tolerated
    let orphan = LogEntry::new(
        format!("{}_after_restore", RESET_MARKER),
        "system",
        Details::new(),
        "ab".repeat(32),
    )?;
    let mut all = lines(log.log_path());
    all.push(serde_json::to_string(&orphan)?);
    write_lines(log.log_path(), &all);

    let report = log.verify()?;
    assert!(report.valid);
    assert_eq!(report.authorized_resets, vec![4]);

    // The same broken link on an ordinary entry is corruption
    let stray = LogEntry::new("server_started", "system", Details::new(), "cd".repeat(32))?;
    all.push(serde_json::to_string(&stray)?);
    write_lines(log.log_path(), &all);

    let report = log.verify()?;
    assert!(!report.valid);
    assert_eq!(report.corrupted_events[0].index, 5);
    assert_eq!(report.corrupted_events[0].reason, CorruptionReason::BrokenLink);

    Ok(())
}

#[test]
fn test_tampered_reset_entry_is_corruption() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = HashChainLog::open(dir.path(), LogOptions::default())?;
    fill(&log, 1)?;

    let mut all = lines(log.log_path());
    all[0] = all[0].replace("\"resumed_from\":\"genesis\"", "\"resumed_from\":\"log\"");
    write_lines(log.log_path(), &all);

    let report = log.verify()?;
    assert!(!report.valid);
    assert_eq!(report.corrupted_events[0].index, 0);
    assert_eq!(report.corrupted_events[0].reason, CorruptionReason::HashMismatch);

    Ok(())
}

#[test]
fn test_auto_recovery_on_open() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let hashes = {
        let log = HashChainLog::open(dir.path(), quiet())?;
        let hashes = fill(&log, 5)?;
        tamper_port(log.log_path(), 1);
        hashes
    };

    let log = HashChainLog::open(dir.path(), LogOptions::default())?;
    assert!(log.verify()?.valid);

    let entries = log.entries(None, None)?;
    // Newest first: initialization, recovery, then the surviving prefix
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].action, RESET_MARKER);
    assert_eq!(entries[0].prev_hash, entries[1].current_hash);
    assert_eq!(entries[1].action, "audit_chain_recovered");
    assert_eq!(entries[1].category, "security");
    assert_eq!(entries[1].prev_hash, hashes[0]);
    assert_eq!(entries[1].details["events_removed"], json!(4));
    assert_eq!(entries[2].current_hash, hashes[0]);

    let security = log.security().recent(10);
    assert!(security.iter().any(|line| line.contains("audit_chain_corrupted")));
    assert!(security.iter().any(|line| line.contains("audit_chain_repaired")));

    let backups = fs::read_dir(dir.path())?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".backup-"))
        .count();
    assert_eq!(backups, 1);

    Ok(())
}

#[test]
fn test_no_auto_repair_leaves_log_alone() -> Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let log = HashChainLog::open(dir.path(), quiet())?;
        fill(&log, 3)?;
        tamper_port(log.log_path(), 0);
    }
    let before = fs::read(dir.path().join("audit.jsonl"))?;

    let options = LogOptions {
        auto_repair: false,
        ..quiet()
    };
    let log = HashChainLog::open(dir.path(), options)?;
    assert!(!log.verify()?.valid);
    assert_eq!(fs::read(log.log_path())?, before);

    Ok(())
}

#[test]
fn test_resume_from_pointer_when_log_missing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let tail = {
        let log = HashChainLog::open(dir.path(), quiet())?;
        fill(&log, 3)?.pop().unwrap()
    };
    fs::remove_file(dir.path().join("audit.jsonl"))?;

    let log = HashChainLog::open(dir.path(), LogOptions::default())?;
    let init = &log.entries(None, None)?[0];
    assert_eq!(init.action, RESET_MARKER);
    assert_eq!(init.prev_hash, tail);
    assert_eq!(init.details["resumed_from"], json!("pointer"));

    let report = log.verify()?;
    assert!(report.valid);
    assert_eq!(report.authorized_resets, vec![0]);

    Ok(())
}

#[test]
fn test_failed_write_keeps_tail() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("audit");
    let log = HashChainLog::open(&root, quiet())?;
    let hashes = fill(&log, 2)?;

    fs::remove_dir_all(&root)?;

    let err = log
        .append("server_started", "system", Details::new())
        .unwrap_err();
    assert!(matches!(err, Error::ChainWrite(_)));
    assert_eq!(log.last_hash(), hashes[1]);

    Ok(())
}

#[test]
fn test_torn_line_is_cut_before_next_append() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = HashChainLog::open(dir.path(), quiet())?;
    let first = log.append("a", "system", Details::new())?;

    // Leftover of a write that failed partway
    {
        use std::io::Write;
        let mut file = fs::OpenOptions::new().append(true).open(log.log_path())?;
        file.write_all(b"{\"action\":\"b\",\"categ")?;
    }

    let next = log.append("c", "system", Details::new())?;
    assert!(log.verify()?.valid);
    assert_eq!(lines(log.log_path()).len(), 2);

    let entries = log.entries(None, None)?;
    let actions: Vec<&str> = entries.iter().map(|e| e.action.as_str()).collect();
    assert_eq!(actions, vec!["c", "a"]);
    assert_eq!(entries[0].prev_hash, first);
    assert_eq!(entries[0].current_hash, next);
    assert_eq!(log.last_hash(), next);

    let security = log.security().recent(10);
    assert!(security.iter().any(|line| line.contains("audit_torn_write_truncated")));

    Ok(())
}

#[test]
fn test_failed_repair_restores_original() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = HashChainLog::open(dir.path(), quiet())?;
    let hashes = fill(&log, 3)?;

    tamper_port(log.log_path(), 1);
    let tampered = fs::read(log.log_path())?;

    // Blocks creation of the rewrite's scratch file
    fs::create_dir(dir.path().join("audit.repair.tmp"))?;

    let err = log.repair().unwrap_err();
    assert!(matches!(err, Error::ChainRepair(_)));
    assert_eq!(fs::read(log.log_path())?, tampered);
    assert_eq!(log.last_hash(), hashes[2]);

    let backups = fs::read_dir(dir.path())?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("audit.jsonl.backup-"))
        .count();
    assert_eq!(backups, 1);

    let security = log.security().recent(10);
    assert!(
        security
            .iter()
            .any(|line| line.contains("[CRITICAL] audit_repair_failed"))
    );

    Ok(())
}

#[test]
fn test_integrity_tag_detects_modification() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = HashChainLog::open(dir.path(), quiet())?;
    fill(&log, 2)?;

    let digest = log.integrity().tag(log.log_path())?;
    assert_eq!(digest.len(), 64);
    assert_eq!(log.integrity().check(log.log_path())?, IntegrityStatus::Valid);

    log.append("server_stopped", "system", Details::new())?;
    match log.integrity().check(log.log_path())? {
        IntegrityStatus::Invalid { expected, actual } => {
            assert_eq!(expected, digest);
            assert_ne!(actual, digest);
        }
        other => panic!("expected Invalid, got {:?}", other),
    }

    Ok(())
}
