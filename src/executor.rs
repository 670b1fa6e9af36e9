//! Transactional merge execution.
//!
//! A cluster is merged all-or-nothing: the merged survivor and every absorbed
//! record are written in one versioned commit, and audit events are appended
//! only once that commit succeeded. While a cluster is in flight its record
//! ids are held exclusively in a [`LockTable`], so distinct clusters can
//! commit concurrently.

use failsafe::CircuitBreaker;
use rayon::prelude::*;
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditLog, Operation, PendingEvent};
use crate::errors::{PipelineError, ResultExt, StoreError};
use crate::merge::{absorb, build_survivor, MergePlan};
use crate::models::{Record, RecordId, RecordStatus};
use crate::storage::{RecordStore, VersionedWrite};
use crate::validator::{error_count, validate, ValidationFinding};

pub const MERGE_ACTOR: &str = "merge-executor";

// ============ Record locks ============

/// Exclusive ownership of record ids.
#[derive(Debug, Default)]
pub struct LockTable {
    held: Mutex<HashSet<RecordId>>,
    released: Condvar,
}

/// Releases its ids when dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    table: &'a LockTable,
    ids: Vec<RecordId>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(ids: &[RecordId]) -> Vec<RecordId> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Blocks until every id is free, then takes them all.
    pub fn acquire(&self, ids: &[RecordId]) -> Result<LockGuard<'_>, PipelineError> {
        let ids = Self::sorted(ids);
        let mut held = self.held.lock().map_err(|_| StoreError::Poisoned)?;
        while ids.iter().any(|id| held.contains(id)) {
            held = self.released.wait(held).map_err(|_| StoreError::Poisoned)?;
        }
        for id in &ids {
            held.insert(id.clone());
        }
        Ok(LockGuard { table: self, ids })
    }

    /// Takes every id, or none if any is already held.
    pub fn try_acquire(&self, ids: &[RecordId]) -> Option<LockGuard<'_>> {
        let ids = Self::sorted(ids);
        let mut held = self.held.lock().ok()?;
        if ids.iter().any(|id| held.contains(id)) {
            return None;
        }
        for id in &ids {
            held.insert(id.clone());
        }
        Some(LockGuard { table: self, ids })
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.held.lock().map(|h| h.contains(id)).unwrap_or(false)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.table.held.lock().unwrap_or_else(|e| e.into_inner());
        for id in &self.ids {
            held.remove(id);
        }
        self.table.released.notify_all();
    }
}

// ============ Execution ============

#[derive(Debug, Clone)]
pub enum ClusterOutcome {
    Committed {
        plan: MergePlan,
        survivor: Record,
        /// Audit sequence numbers of the survivor and absorb events.
        audit_seqs: Vec<u64>,
    },
    /// Nothing was written; the cluster goes to review.
    RolledBack {
        plan: MergePlan,
        reason: String,
        findings: Vec<ValidationFinding>,
    },
}

impl ClusterOutcome {
    pub fn plan(&self) -> &MergePlan {
        match self {
            ClusterOutcome::Committed { plan, .. } | ClusterOutcome::RolledBack { plan, .. } => plan,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, ClusterOutcome::Committed { .. })
    }
}

pub struct MergeExecutor<'a, B> {
    store: &'a dyn RecordStore,
    audit: &'a AuditLog,
    breaker: &'a B,
    locks: LockTable,
}

impl<'a, B> MergeExecutor<'a, B>
where
    B: CircuitBreaker + Sync,
{
    pub fn new(store: &'a dyn RecordStore, audit: &'a AuditLog, breaker: &'a B) -> Self {
        Self {
            store,
            audit,
            breaker,
            locks: LockTable::new(),
        }
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Commits a set of writes through the circuit breaker.
    ///
    /// `Ok(Err(_))` is a store failure the caller rolls back from; `Err(_)`
    /// means the breaker is open and the batch has to stop.
    fn guarded_commit(&self, writes: Vec<VersionedWrite>) -> Result<Result<(), StoreError>, PipelineError> {
        match self.breaker.call(|| self.store.commit(writes)) {
            Ok(()) => Ok(Ok(())),
            Err(failsafe::Error::Inner(e)) => Ok(Err(e)),
            Err(failsafe::Error::Rejected) => {
                error!("🛑 Store circuit breaker open; aborting merges");
                Err(PipelineError::ResourceExhausted(
                    "record store circuit breaker is open".to_string(),
                ))
            }
        }
    }

    fn rolled_back(plan: &MergePlan, reason: String, findings: Vec<ValidationFinding>) -> ClusterOutcome {
        warn!(
            "↩️ Rolled back merge {} into {}: {}",
            plan.plan_id, plan.surviving_record_id, reason
        );
        ClusterOutcome::RolledBack {
            plan: plan.clone(),
            reason,
            findings,
        }
    }

    /// Executes one plan. Only an open breaker or a broken audit log is an error.
    pub fn execute(&self, plan: &MergePlan) -> Result<ClusterOutcome, PipelineError> {
        let ids = plan.member_ids();
        let _guard = self.locks.acquire(&ids)?;

        let mut members = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.store.get(id) {
                Ok(record) => members.push(record),
                Err(e) => return Ok(Self::rolled_back(plan, e.to_string(), Vec::new())),
            }
        }
        for member in &members {
            let planned = plan.member_versions.get(&member.id).copied();
            if planned != Some(member.version) || !member.is_active() {
                let reason = format!(
                    "record {} changed since planning (v{:?} planned, v{} {:?} stored)",
                    member.id, planned, member.version, member.status
                );
                return Ok(Self::rolled_back(plan, reason, Vec::new()));
            }
        }

        let survivor = match build_survivor(plan, &members) {
            Ok(record) => record,
            Err(e) => return Ok(Self::rolled_back(plan, e.to_string(), Vec::new())),
        };
        let findings = validate(&survivor);
        if error_count(&findings) > 0 {
            let reason = format!("merged record fails validation ({} error(s))", error_count(&findings));
            return Ok(Self::rolled_back(plan, reason, findings));
        }

        let mut writes = Vec::with_capacity(members.len());
        let mut events = Vec::with_capacity(members.len());
        let detail = serde_json::to_value(plan).unwrap_or_default();
        for member in &members {
            if member.id == plan.surviving_record_id {
                writes.push(VersionedWrite::new(member.version, survivor.clone()));
                events.push(
                    PendingEvent::new(Operation::MergeSurvivor, MERGE_ACTOR, member.version, survivor.clone())
                        .with_detail(detail.clone()),
                );
            } else {
                let absorbed = absorb(member, &plan.surviving_record_id);
                events.push(
                    PendingEvent::new(Operation::MergeAbsorb, MERGE_ACTOR, member.version, absorbed.clone())
                        .with_detail(json!({
                            "plan_id": plan.plan_id,
                            "merged_into": plan.surviving_record_id,
                        })),
                );
                writes.push(VersionedWrite::new(member.version, absorbed));
            }
        }

        if let Err(e) = self.guarded_commit(writes)? {
            return Ok(Self::rolled_back(plan, e.to_string(), Vec::new()));
        }
        let audit_seqs = self
            .audit
            .append_all(events)
            .with_context(|| format!("recording merge {}", plan.plan_id))?;

        let conflicts = plan.conflicts().count();
        if conflicts > 0 {
            warn!(
                "Merge {} kept {} conflicting field(s) as alternatives",
                plan.plan_id, conflicts
            );
        }
        debug!(
            "Merged {} record(s) into {} (v{})",
            plan.absorbed_record_ids.len(),
            survivor.id,
            survivor.version
        );
        Ok(ClusterOutcome::Committed {
            plan: plan.clone(),
            survivor,
            audit_seqs,
        })
    }

    /// Executes plans concurrently; outcomes follow plan order.
    ///
    /// Stops at the first fatal error. Clusters already committed stay committed.
    pub fn execute_all(&self, plans: &[MergePlan]) -> Result<Vec<ClusterOutcome>, PipelineError> {
        let outcomes: Vec<ClusterOutcome> = plans
            .par_iter()
            .map(|plan| self.execute(plan))
            .collect::<Result<_, _>>()?;
        let committed = outcomes.iter().filter(|o| o.is_committed()).count();
        info!(
            "🔗 Merge execution: {} committed, {} rolled back",
            committed,
            outcomes.len() - committed
        );
        Ok(outcomes)
    }

    /// Restores every member of a committed merge to its pre-merge state
    /// under a new version. Returns the restored records.
    ///
    /// This is the only write a `merged` record ever receives, and only while
    /// every member is still exactly as the merge left it; a second revert or
    /// a revert after later changes is refused with a version conflict.
    pub fn revert(&self, plan: &MergePlan) -> Result<Vec<Record>, PipelineError> {
        let ids = plan.member_ids();
        let _guard = self.locks.acquire(&ids)?;

        let mut writes = Vec::with_capacity(ids.len());
        let mut events = Vec::with_capacity(ids.len());
        for id in &ids {
            let planned = plan.member_versions.get(id).copied().ok_or_else(|| {
                PipelineError::Parse(format!("merge plan {} has no version for {}", plan.plan_id, id))
            })?;
            let current = self
                .store
                .get(id)
                .with_context(|| format!("reverting merge {}", plan.plan_id))?;
            // only the exact state this merge produced may be reopened
            let expected_status = if *id == plan.surviving_record_id {
                RecordStatus::Active
            } else {
                RecordStatus::Merged
            };
            let untouched = current.version == planned + 1
                && current.status == expected_status
                && (expected_status == RecordStatus::Active
                    || current.merged_into.as_deref() == Some(plan.surviving_record_id.as_str()));
            if !untouched {
                warn!(
                    "Refusing to revert merge {}: {} changed since the merge",
                    plan.plan_id, id
                );
                return Err(PipelineError::Store(StoreError::VersionConflict {
                    record_id: id.clone(),
                    expected: planned + 1,
                    actual: current.version,
                }));
            }
            let mut restored = self
                .audit
                .state_at(id, planned)
                .ok_or_else(|| StoreError::NotFound(format!("{}@v{}", id, planned)))
                .with_context(|| format!("reverting merge {}", plan.plan_id))?;
            restored.version = current.version;
            restored.status = RecordStatus::Active;
            restored.merged_into = None;
            restored.touch();

            events.push(
                PendingEvent::new(Operation::Unmerge, MERGE_ACTOR, current.version, restored.clone())
                    .with_detail(json!({ "plan_id": plan.plan_id })),
            );
            writes.push(VersionedWrite::new(current.version, restored));
        }

        let restored: Vec<Record> = writes.iter().map(|w| w.record.clone()).collect();
        self.guarded_commit(writes)?
            .with_context(|| format!("reverting merge {}", plan.plan_id))?;
        self.audit
            .append_all(events)
            .with_context(|| format!("recording unmerge {}", plan.plan_id))?;
        info!("Reverted merge {} ({} record(s))", plan.plan_id, restored.len());
        Ok(restored)
    }

    /// Reverts a merge found in the audit log by plan id.
    pub fn revert_by_id(&self, plan_id: &str) -> Result<Vec<Record>, PipelineError> {
        let plan = find_plan(self.audit, plan_id)
            .ok_or_else(|| StoreError::NotFound(format!("merge plan {}", plan_id)))?;
        self.revert(&plan)
    }
}

/// Looks a committed merge plan up in the audit log.
pub fn find_plan(audit: &AuditLog, plan_id: &str) -> Option<MergePlan> {
    audit
        .events()
        .into_iter()
        .filter(|e| e.operation == Operation::MergeSurvivor)
        .filter(|e| e.detail.get("plan_id").and_then(|v| v.as_str()) == Some(plan_id))
        .find_map(|e| serde_json::from_value(e.detail).ok())
}
