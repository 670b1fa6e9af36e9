//! Compliance orchestration: validate, repair, re-validate, rewrite, validate.
//!
//! ```text
//! Imported -> Validated1 -> Repaired -> Validated2 -> Rewritten -> Validated3 -> Clean
//!                        \_(no errors)_/          \-> Rejected
//! ```
//!
//! The batch is processed stage by stage so that each validator pass runs
//! over the whole batch at once on the worker pool. A record's rejection
//! never affects any other record.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{Operation, PendingEvent};
use crate::models::Record;
use crate::repairer::{repair, RepairReport};
use crate::rewriter::{QualityFlag, QualityReport, QualityRewriter, RuleFlag};
use crate::validator::{error_count, validate_batch, ValidationFinding};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComplianceState {
    Imported,
    Validated1,
    Repaired,
    Validated2,
    Rewritten,
    Validated3,
    Clean,
    Rejected,
}

/// Result of running one record through the state machine.
#[derive(Debug, Clone)]
pub struct ComplianceOutcome {
    /// The clean record, or for a rejected record its post-repair version.
    pub record: Record,
    /// Terminal state: `Clean` or `Rejected`.
    pub state: ComplianceState,
    /// Every state the record passed through, in order.
    pub trail: Vec<ComplianceState>,
    pub initial_findings: Vec<ValidationFinding>,
    /// Findings of the last validator pass that decided the outcome.
    pub final_findings: Vec<ValidationFinding>,
    pub repair: Option<RepairReport>,
    pub quality: Option<QualityReport>,
    /// The rewrite raised the error count and was discarded.
    pub regression: bool,
    /// Audit events for the mutations that were kept, oldest first.
    pub events: Vec<PendingEvent>,
}

impl ComplianceOutcome {
    pub fn is_clean(&self) -> bool {
        self.state == ComplianceState::Clean
    }
}

struct InFlight {
    original_version: u64,
    current: Record,
    trail: Vec<ComplianceState>,
    initial_findings: Vec<ValidationFinding>,
    repair: Option<RepairReport>,
    events: Vec<PendingEvent>,
}

pub struct ComplianceOrchestrator {
    rewriter: QualityRewriter,
}

impl ComplianceOrchestrator {
    pub fn new(rewriter: QualityRewriter) -> Self {
        Self { rewriter }
    }

    pub fn rewriter(&self) -> &QualityRewriter {
        &self.rewriter
    }

    /// Runs a single record through the state machine.
    pub fn process(&self, record: Record) -> ComplianceOutcome {
        let mut outcomes = self.run_batch(vec![record]);
        match outcomes.pop() {
            Some(outcome) => outcome,
            None => unreachable!("one record in, one outcome out"),
        }
    }

    /// Runs a batch; outcomes are returned in input order.
    pub fn run_batch(&self, records: Vec<Record>) -> Vec<ComplianceOutcome> {
        let total = records.len();

        // Imported -> Validated1
        let first = validate_batch(&records);

        // Validated1 -> Repaired (only when errors exist)
        let mut in_flight: Vec<InFlight> = records
            .into_par_iter()
            .zip(first.into_par_iter())
            .map(|(record, findings)| {
                let mut trail = vec![ComplianceState::Imported, ComplianceState::Validated1];
                let original_version = record.version;
                let mut events = Vec::new();
                let (current, repair_report) = if error_count(&findings) > 0 {
                    let (repaired, report) = repair(&record, &findings);
                    trail.push(ComplianceState::Repaired);
                    if !report.is_empty() {
                        events.push(
                            PendingEvent::new(
                                Operation::Repair,
                                "repairer",
                                record.version,
                                repaired.clone(),
                            )
                            .with_detail(serde_json::to_value(&report).unwrap_or_default()),
                        );
                    }
                    (repaired, Some(report))
                } else {
                    (record, None)
                };
                InFlight {
                    original_version,
                    current,
                    trail,
                    initial_findings: findings,
                    repair: repair_report,
                    events,
                }
            })
            .collect();

        // -> Validated2
        let snapshot: Vec<Record> = in_flight.iter().map(|f| f.current.clone()).collect();
        let second = validate_batch(&snapshot);
        drop(snapshot);
        for flight in &mut in_flight {
            flight.trail.push(ComplianceState::Validated2);
        }

        // Validated2 -> Rewritten, for records that passed
        let rewritten: Vec<Option<(Record, QualityReport)>> = in_flight
            .par_iter()
            .zip(second.par_iter())
            .map(|(flight, findings)| {
                (error_count(findings) == 0).then(|| self.rewriter.rewrite(&flight.current))
            })
            .collect();

        // -> Validated3
        let rewritten_records: Vec<Record> = rewritten
            .iter()
            .flatten()
            .map(|(record, _)| record.clone())
            .collect();
        let mut third = validate_batch(&rewritten_records).into_iter();

        let mut outcomes = Vec::with_capacity(total);
        for ((mut flight, second_findings), rewrite) in
            in_flight.into_iter().zip(second).zip(rewritten)
        {
            let Some((candidate, mut report)) = rewrite else {
                warn!(
                    "Rejected record {}: {} structural error(s) remain after repair",
                    flight.current.id,
                    error_count(&second_findings)
                );
                flight.trail.push(ComplianceState::Rejected);
                outcomes.push(ComplianceOutcome {
                    record: flight.current,
                    state: ComplianceState::Rejected,
                    trail: flight.trail,
                    initial_findings: flight.initial_findings,
                    final_findings: second_findings,
                    repair: flight.repair,
                    quality: None,
                    regression: false,
                    events: flight.events,
                });
                continue;
            };

            flight.trail.push(ComplianceState::Rewritten);
            flight.trail.push(ComplianceState::Validated3);
            let third_findings = third.next().unwrap_or_default();
            let errors_before = error_count(&second_findings);
            let errors_after = error_count(&third_findings);

            let (record, final_findings, regression) = if errors_after > errors_before {
                warn!(
                    "Discarding rewrite of record {}: errors {} -> {}",
                    flight.current.id, errors_before, errors_after
                );
                report.flags.push(RuleFlag {
                    rule: "compliance".to_string(),
                    flag: QualityFlag::RewriteDiscarded {
                        errors_before,
                        errors_after,
                    },
                });
                report.version_after = report.version_before;
                (flight.current, second_findings, true)
            } else {
                if report.changed() {
                    flight.events.push(
                        PendingEvent::new(
                            Operation::Rewrite,
                            format!("rewriter:{}", self.rewriter.rule_names().join("+")),
                            flight.current.version,
                            candidate.clone(),
                        )
                        .with_detail(serde_json::to_value(&report.edits).unwrap_or_default()),
                    );
                }
                (candidate, third_findings, false)
            };

            flight.trail.push(ComplianceState::Clean);
            debug!(
                "Record {} clean at v{} (from v{})",
                record.id, record.version, flight.original_version
            );
            outcomes.push(ComplianceOutcome {
                record,
                state: ComplianceState::Clean,
                trail: flight.trail,
                initial_findings: flight.initial_findings,
                final_findings,
                repair: flight.repair,
                quality: Some(report),
                regression,
                events: flight.events,
            });
        }

        let clean = outcomes.iter().filter(|o| o.is_clean()).count();
        let regressions = outcomes.iter().filter(|o| o.regression).count();
        info!(
            "Compliance finished: {} clean, {} rejected, {} regression(s) of {} record(s)",
            clean,
            total - clean,
            regressions,
            total
        );
        outcomes
    }
}
