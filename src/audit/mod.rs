//! Tamper-evident audit trail.
//!
//! Every lifecycle and operational action taken against the fleet is
//! appended to a `HashChainLog`. Each `LogEntry` stores the SHA-256 of its
//! own fields plus the previous entry's hash, so editing, inserting or
//! deleting a line breaks the chain and `verify` reports it.
//!
//! Beside the chain live two unchained helpers:
//!
//! * `SecurityEvents` - a plain text stream of operational security notes
//! * `FileIntegrity` - content tags attached to arbitrary files
//!
//! # Reset entries
//!
//! An entry whose action starts with `audit_system_initialized` may either
//! continue the chain or restart it from the all-zero `GENESIS_HASH`. Such
//! entries are exempt from broken-link classification; their own hash is
//! still checked.
mod chain;
mod entry;
mod integrity;
mod security;

pub use chain::{
    CorruptedEntry, CorruptionReason, HashChainLog, LogOptions, RepairReport, VerifyReport,
};
pub use entry::{
    ChainPointer, Details, GENESIS_HASH, LogEntry, RESET_MARKER, compute_hash, details,
};
pub use integrity::{FileIntegrity, IntegrityStatus};
pub use security::{SecurityEvents, Severity};
