//! Append-only, checksummed record history.
//!
//! Every mutation of a record is one event carrying a full snapshot of the
//! record after the mutation, so the current state of any record is a fold
//! over its events and any earlier version can be reconstructed. Truncating
//! the log rolls history back.
//!
//! Each event is sealed with a SHA-256 checksum over its contents so that
//! tampering with a stored event is detectable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::errors::StoreError;
use crate::models::{Record, RecordId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Import,
    Repair,
    Rewrite,
    MergeSurvivor,
    MergeAbsorb,
    Unmerge,
}

/// An event about to be appended (sequence number, time and checksum are assigned by the log).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub record_id: RecordId,
    pub version_before: u64,
    pub version_after: u64,
    pub operation: Operation,
    pub actor: String,
    /// Record state after the mutation.
    pub payload: Record,
    /// Operation-specific data (merge plan, flagged conflicts, reports).
    pub detail: serde_json::Value,
}

impl PendingEvent {
    pub fn new(operation: Operation, actor: impl Into<String>, version_before: u64, payload: Record) -> Self {
        Self {
            record_id: payload.id.clone(),
            version_before,
            version_after: payload.version,
            operation,
            actor: actor.into(),
            payload,
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: u64,
    pub record_id: RecordId,
    pub version_before: u64,
    pub version_after: u64,
    pub operation: Operation,
    pub actor: String,
    pub payload: Record,
    pub detail: serde_json::Value,
    pub at: DateTime<Utc>,
    /// SHA-256 of every other field (hex encoded).
    pub checksum: String,
}

/// The checksummed view of an event: everything except the checksum itself.
#[derive(Serialize)]
struct Sealed<'a> {
    seq: u64,
    record_id: &'a str,
    version_before: u64,
    version_after: u64,
    operation: Operation,
    actor: &'a str,
    payload: &'a Record,
    detail: &'a serde_json::Value,
    at: &'a DateTime<Utc>,
}

impl AuditEvent {
    fn seal(seq: u64, pending: PendingEvent, at: DateTime<Utc>) -> Self {
        let mut event = Self {
            seq,
            record_id: pending.record_id,
            version_before: pending.version_before,
            version_after: pending.version_after,
            operation: pending.operation,
            actor: pending.actor,
            payload: pending.payload,
            detail: pending.detail,
            at,
            checksum: String::new(),
        };
        event.checksum = event.compute_checksum();
        event
    }

    fn compute_checksum(&self) -> String {
        let sealed = Sealed {
            seq: self.seq,
            record_id: &self.record_id,
            version_before: self.version_before,
            version_after: self.version_after,
            operation: self.operation,
            actor: &self.actor,
            payload: &self.payload,
            detail: &self.detail,
            at: &self.at,
        };
        let bytes = serde_json::to_vec(&sealed).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }

    /// True if the checksum still matches the event contents.
    pub fn is_valid(&self) -> bool {
        self.compute_checksum() == self.checksum
    }
}

/// Why [`AuditLog::verify`] rejected the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditViolation {
    ChecksumMismatch { seq: u64 },
    SequenceGap { expected: u64, found: u64 },
    BrokenVersionChain { seq: u64, record_id: RecordId, expected: u64, found: u64 },
}

impl std::fmt::Display for AuditViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditViolation::ChecksumMismatch { seq } => {
                write!(f, "event {} does not match its checksum", seq)
            }
            AuditViolation::SequenceGap { expected, found } => {
                write!(f, "expected event {} but found {}", expected, found)
            }
            AuditViolation::BrokenVersionChain {
                seq,
                record_id,
                expected,
                found,
            } => write!(
                f,
                "event {} for record {} starts at version {} but the previous event ended at {}",
                seq, record_id, found, expected
            ),
        }
    }
}

/// Append-only audit log shared by all stages of a batch.
#[derive(Debug, Default)]
pub struct AuditLog {
    events: RwLock<Vec<AuditEvent>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, pending: PendingEvent) -> Result<u64, StoreError> {
        let mut seqs = self.append_all(vec![pending])?;
        seqs.pop().ok_or(StoreError::Poisoned)
    }

    /// Appends events contiguously; returns their sequence numbers.
    pub fn append_all(&self, pending: Vec<PendingEvent>) -> Result<Vec<u64>, StoreError> {
        let mut events = self.events.write().map_err(|_| StoreError::Poisoned)?;
        let at = Utc::now();
        let mut seqs = Vec::with_capacity(pending.len());
        for event in pending {
            let seq = events.len() as u64;
            events.push(AuditEvent::seal(seq, event, at));
            seqs.push(seq);
        }
        Ok(seqs)
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current length, usable later as a [`truncate`](Self::truncate) point.
    pub fn mark(&self) -> usize {
        self.len()
    }

    /// Drops every event from `len` on and returns them, newest last.
    pub fn truncate(&self, len: usize) -> Result<Vec<AuditEvent>, StoreError> {
        let mut events = self.events.write().map_err(|_| StoreError::Poisoned)?;
        if len >= events.len() {
            return Ok(Vec::new());
        }
        Ok(events.split_off(len))
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.read().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn events_for(&self, record_id: &str) -> Vec<AuditEvent> {
        self.events
            .read()
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.record_id == record_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Current state of a record as a fold over its events.
    pub fn replay(&self, record_id: &str) -> Option<Record> {
        self.events_for(record_id)
            .into_iter()
            .fold(None, |_, event| Some(event.payload))
    }

    /// State of a record as of `version` (the latest event not past it).
    pub fn state_at(&self, record_id: &str, version: u64) -> Option<Record> {
        self.events_for(record_id)
            .into_iter()
            .take_while(|e| e.version_after <= version)
            .last()
            .map(|e| e.payload)
    }

    /// Checks checksums, sequence numbering and per-record version chains.
    pub fn verify(&self) -> Result<(), AuditViolation> {
        let events = self.events();
        let mut last_version: HashMap<&str, u64> = HashMap::new();
        for (index, event) in events.iter().enumerate() {
            if event.seq != index as u64 {
                return Err(AuditViolation::SequenceGap {
                    expected: index as u64,
                    found: event.seq,
                });
            }
            if !event.is_valid() {
                tracing::warn!(
                    "Audit validation failed: checksum mismatch on event {} ({})",
                    event.seq,
                    event.record_id
                );
                return Err(AuditViolation::ChecksumMismatch { seq: event.seq });
            }
            if let Some(previous) = last_version.get(event.record_id.as_str()) {
                if *previous != event.version_before {
                    return Err(AuditViolation::BrokenVersionChain {
                        seq: event.seq,
                        record_id: event.record_id.clone(),
                        expected: *previous,
                        found: event.version_before,
                    });
                }
            }
            last_version.insert(event.record_id.as_str(), event.version_after);
        }
        Ok(())
    }

    /// Replaces the stored events wholesale (used to load a persisted log).
    pub fn from_events(events: Vec<AuditEvent>) -> Self {
        Self {
            events: RwLock::new(events),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Provenance;

    fn snapshot(id: &str, version: u64, title: &str) -> Record {
        let mut r = Record::new(
            id,
            Provenance {
                source: "test".to_string(),
                imported_at: Utc::now(),
            },
        );
        r.version = version;
        r.job_title = Some(title.to_string());
        r
    }

    fn history() -> AuditLog {
        let log = AuditLog::new();
        log.append(PendingEvent::new(Operation::Import, "importer", 0, snapshot("a", 1, "v1")))
            .unwrap();
        log.append(PendingEvent::new(Operation::Import, "importer", 0, snapshot("b", 1, "b1")))
            .unwrap();
        log.append(PendingEvent::new(Operation::Repair, "repairer", 1, snapshot("a", 2, "v2")))
            .unwrap();
        log.append(PendingEvent::new(Operation::Rewrite, "rewriter", 2, snapshot("a", 3, "v3")))
            .unwrap();
        log
    }

    #[test]
    fn test_replay_and_state_at() {
        let log = history();
        assert_eq!(log.replay("a").unwrap().job_title.as_deref(), Some("v3"));
        assert_eq!(log.state_at("a", 2).unwrap().job_title.as_deref(), Some("v2"));
        assert_eq!(log.state_at("a", 1).unwrap().version, 1);
        assert!(log.state_at("a", 0).is_none());
        assert!(log.replay("zz").is_none());
    }

    #[test]
    fn test_verify_detects_tampering() {
        let log = history();
        assert_eq!(log.verify(), Ok(()));

        let mut events = log.events();
        events[2].payload.job_title = Some("forged".to_string());
        let forged = AuditLog::from_events(events);
        assert_eq!(forged.verify(), Err(AuditViolation::ChecksumMismatch { seq: 2 }));
    }

    #[test]
    fn test_verify_detects_broken_chain() {
        let log = history();
        log.append(PendingEvent::new(Operation::Rewrite, "rewriter", 7, snapshot("a", 8, "x")))
            .unwrap();
        assert!(matches!(
            log.verify(),
            Err(AuditViolation::BrokenVersionChain { expected: 3, found: 7, .. })
        ));
    }

    #[test]
    fn test_truncate_rolls_back_history() {
        let log = history();
        let mark = 3;
        let removed = log.truncate(mark).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].operation, Operation::Rewrite);
        assert_eq!(log.replay("a").unwrap().version, 2);
        assert_eq!(log.mark(), 3);
        assert!(log.truncate(10).unwrap().is_empty());
        assert_eq!(log.verify(), Ok(()));
    }

    #[test]
    fn test_checksum_consistency() {
        let at = Utc::now();
        let pending = PendingEvent::new(Operation::Import, "importer", 0, snapshot("a", 1, "t"));
        let one = AuditEvent::seal(0, pending.clone(), at);
        let two = AuditEvent::seal(0, pending, at);
        assert_eq!(one.checksum, two.checksum);
        assert!(one.is_valid());
    }
}
