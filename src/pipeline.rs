//! The batch pipeline: import, compliance, deduplication.
//!
//! Each stage commits its output (store writes plus audit events) before the
//! next one starts. Per-record and per-cluster problems are counted and sent
//! to the review queue; only an exhausted resource (an open storage circuit
//! breaker) aborts the batch.

use chrono::Utc;
use failsafe::CircuitBreaker;
use serde::Serialize;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audit::{AuditLog, Operation, PendingEvent};
use crate::blocking::{BlockIndex, BlockingConfig};
use crate::circuit_breaker::create_store_circuit_breaker;
use crate::compliance::ComplianceOrchestrator;
use crate::config::PipelineConfig;
use crate::errors::{PipelineError, ResultExt};
use crate::executor::{ClusterOutcome, MergeExecutor};
use crate::importer::{Importer, SourceBatch};
use crate::merge::{cluster_pairs, MergePlanner};
use crate::models::{Record, RecordId};
use crate::normalize::PhoneCanonicalizer;
use crate::review::{CandidateReason, ReviewItem, ReviewQueue};
use crate::rewriter::QualityRewriter;
use crate::scoring::{score_candidates, MatchDecision, MatchThresholds};
use crate::storage::{MemoryStore, RecordStore, VersionedWrite};
use crate::validator::is_structurally_valid;
use crate::vcard;

/// Phone parse results memoised per pipeline.
const PHONE_CACHE_CAPACITY: u64 = 10_000;

/// Counts per kind of outcome for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub imported: usize,
    pub parse_failures: usize,
    pub repaired: usize,
    pub rejected: usize,
    pub regressions: usize,
    pub rewritten: usize,
    pub clean: usize,
    pub blocks: usize,
    pub candidates_scored: usize,
    pub auto_merge_pairs: usize,
    pub review_candidates: usize,
    pub clusters_merged: usize,
    pub records_absorbed: usize,
    pub merge_conflicts: usize,
    pub rollbacks: usize,
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    /// Active records after the batch, rejected records excluded.
    pub active: Vec<Record>,
    pub review: Vec<ReviewItem>,
    pub summary: BatchSummary,
}

pub struct Pipeline<B> {
    config: PipelineConfig,
    store: Arc<dyn RecordStore>,
    audit: Arc<AuditLog>,
    compliance: ComplianceOrchestrator,
    breaker: B,
    pool: rayon::ThreadPool,
}

/// A pipeline over a fresh in-memory store and audit log.
pub fn in_memory(
    config: PipelineConfig,
) -> Result<Pipeline<impl CircuitBreaker + Send + Sync>, PipelineError> {
    let breaker = create_store_circuit_breaker(config.store_failure_threshold);
    Pipeline::new(config, Arc::new(MemoryStore::new()), Arc::new(AuditLog::new()), breaker)
}

impl<B> Pipeline<B>
where
    B: CircuitBreaker + Send + Sync,
{
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn RecordStore>,
        audit: Arc<AuditLog>,
        breaker: B,
    ) -> Result<Self, PipelineError> {
        config
            .validate()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        let phones = PhoneCanonicalizer::new(&config.default_region, PHONE_CACHE_CAPACITY)?;
        let rewriter = QualityRewriter::from_names(&config.quality_rules, phones)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("compliance-worker-{}", i))
            .build()
            .map_err(|e| PipelineError::ResourceExhausted(format!("worker pool: {}", e)))?;
        info!(
            "⚙️ Pipeline ready: {} worker(s), rules [{}]",
            pool.current_num_threads(),
            rewriter.rule_names().join(", ")
        );
        Ok(Self {
            config,
            store,
            audit,
            compliance: ComplianceOrchestrator::new(rewriter),
            breaker,
            pool,
        })
    }

    /// Replaces the rewriter (custom rule sets, fault injection in tests).
    pub fn with_rewriter(mut self, rewriter: QualityRewriter) -> Self {
        self.compliance = ComplianceOrchestrator::new(rewriter);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// An executor over this pipeline's store, audit log and breaker (for unmerges).
    pub fn executor(&self) -> MergeExecutor<'_, B> {
        MergeExecutor::new(self.store.as_ref(), &self.audit, &self.breaker)
    }

    pub fn run(&self, sources: Vec<SourceBatch>) -> Result<BatchReport, PipelineError> {
        self.pool.install(|| self.run_stages(sources))
    }

    fn run_stages(&self, sources: Vec<SourceBatch>) -> Result<BatchReport, PipelineError> {
        let mut summary = BatchSummary::default();
        let review = ReviewQueue::new();

        let imported = self.import(sources, &mut summary, &review).context("import stage")?;
        self.comply(imported, &mut summary, &review)
            .context("compliance stage")?;
        self.deduplicate(&mut summary, &review)
            .context("deduplication stage")?;

        let active = self.eligible_records().context("reading active records")?;
        info!(
            "✅ Batch complete: {} imported, {} clean, {} rejected, {} merged away, {} for review",
            summary.imported,
            summary.clean,
            summary.rejected,
            summary.records_absorbed,
            review.len()
        );
        Ok(BatchReport {
            active,
            review: review.drain(),
            summary,
        })
    }

    fn import(
        &self,
        sources: Vec<SourceBatch>,
        summary: &mut BatchSummary,
        review: &ReviewQueue,
    ) -> Result<Vec<Record>, PipelineError> {
        let known = self.store.all()?.into_iter().map(|r| r.id);
        let mut importer = Importer::with_known_ids(known);
        let mut records = Vec::new();

        for batch in &sources {
            let result = importer.import(batch, Utc::now());
            summary.parse_failures += result.failures.len();
            review.extend(
                result
                    .failures
                    .into_iter()
                    .map(|failure| ReviewItem::ParseFailure { failure }),
            );

            let mut events = Vec::with_capacity(result.records.len());
            for record in result.records {
                self.store
                    .insert_new(record.clone())
                    .with_context(|| format!("storing imported record {}", record.id))?;
                events.push(PendingEvent::new(
                    Operation::Import,
                    format!("importer:{}", batch.source),
                    0,
                    record.clone(),
                ));
                records.push(record);
            }
            self.audit.append_all(events)?;
        }
        summary.imported = records.len();
        Ok(records)
    }

    /// Active records that pass structural validation.
    ///
    /// Rejected records stay stored and active but never pass, so they are
    /// kept out of dedup and export in this batch and every later one.
    fn eligible_records(&self) -> Result<Vec<Record>, PipelineError> {
        let records: Vec<Record> = self
            .store
            .active()?
            .into_par_iter()
            .filter(is_structurally_valid)
            .collect();
        Ok(records)
    }

    /// Runs the compliance state machine and commits its results.
    fn comply(
        &self,
        records: Vec<Record>,
        summary: &mut BatchSummary,
        review: &ReviewQueue,
    ) -> Result<(), PipelineError> {
        let outcomes = self.compliance.run_batch(records);

        let mut writes = Vec::new();
        let mut events = Vec::new();
        for outcome in outcomes {
            let clean = outcome.is_clean();
            if let Some(first) = outcome.events.first() {
                writes.push(VersionedWrite::new(first.version_before, outcome.record.clone()));
            }
            events.extend(outcome.events);

            if outcome.repair.as_ref().is_some_and(|r| !r.is_empty()) {
                summary.repaired += 1;
            }
            if clean {
                summary.clean += 1;
                if outcome.quality.as_ref().is_some_and(|q| q.changed()) && !outcome.regression {
                    summary.rewritten += 1;
                }
            } else {
                summary.rejected += 1;
                review.push(ReviewItem::RejectedRecord {
                    record_id: outcome.record.id.clone(),
                    findings: outcome.final_findings,
                });
            }
            if outcome.regression {
                summary.regressions += 1;
                if let Some(report) = outcome.quality {
                    review.push(ReviewItem::RewriteDiscarded { report });
                }
            }
        }

        debug!("Committing {} compliance write(s)", writes.len());
        self.store.commit(writes).context("committing compliance results")?;
        self.audit.append_all(events)?;
        Ok(())
    }

    fn deduplicate(&self, summary: &mut BatchSummary, review: &ReviewQueue) -> Result<(), PipelineError> {
        let records = self.eligible_records()?;

        let index = BlockIndex::build(&records, &BlockingConfig::from(&self.config));
        summary.blocks = index.blocks.len();
        let candidates = score_candidates(&records, &index.candidate_pairs());
        summary.candidates_scored = candidates.len();

        let thresholds = MatchThresholds {
            auto_merge: self.config.auto_merge_threshold,
            review: self.config.review_threshold,
        };
        let mut for_review = Vec::new();
        for candidate in &candidates {
            match thresholds.decide(candidate) {
                MatchDecision::AutoMerge => summary.auto_merge_pairs += 1,
                MatchDecision::Review => for_review.push(candidate.clone()),
                MatchDecision::NoMatch => {}
            }
        }

        let by_id: HashMap<&str, &Record> = records.iter().map(|r| (r.id.as_str(), r)).collect();
        let planner = MergePlanner::new(self.config.source_priority.clone());
        let plans: Vec<_> = cluster_pairs(&candidates, &thresholds)
            .into_iter()
            .filter_map(|ids| {
                let members: Vec<Record> = ids
                    .iter()
                    .filter_map(|id| by_id.get(id.as_str()).map(|r| (*r).clone()))
                    .collect();
                planner.plan(&members)
            })
            .collect();
        info!(
            "🔍 Dedup: {} block(s), {} pair(s) scored, {} auto-merge, {} cluster(s)",
            summary.blocks,
            summary.candidates_scored,
            summary.auto_merge_pairs,
            plans.len()
        );

        let outcomes = self.executor().execute_all(&plans)?;
        let mut merged_cluster: HashMap<RecordId, String> = HashMap::new();
        for outcome in outcomes {
            match outcome {
                ClusterOutcome::Committed { plan, .. } => {
                    summary.clusters_merged += 1;
                    summary.records_absorbed += plan.absorbed_record_ids.len();
                    summary.merge_conflicts += plan.conflicts().count();
                    for id in plan.member_ids() {
                        merged_cluster.insert(id, plan.plan_id.clone());
                    }
                }
                ClusterOutcome::RolledBack {
                    plan,
                    reason,
                    findings,
                } => {
                    summary.rollbacks += 1;
                    review.push(ReviewItem::RolledBackCluster {
                        plan,
                        reason,
                        findings,
                    });
                }
            }
        }

        // pairs that ended up in the same merged cluster are already settled
        for candidate in for_review {
            let same_cluster = matches!(
                (merged_cluster.get(&candidate.record_a), merged_cluster.get(&candidate.record_b)),
                (Some(x), Some(y)) if x == y
            );
            if same_cluster {
                continue;
            }
            summary.review_candidates += 1;
            let reason = if candidate.composite_score < thresholds.review {
                CandidateReason::DownWeighted
            } else {
                CandidateReason::Ambiguous
            };
            review.push(ReviewItem::MatchCandidate { reason, candidate });
        }

        if summary.rollbacks > 0 {
            warn!("{} merge cluster(s) rolled back for review", summary.rollbacks);
        }
        Ok(())
    }
}

/// Reads vCard files; each file is one source labelled by its file stem.
pub async fn load_sources(paths: &[PathBuf]) -> Result<Vec<SourceBatch>, PipelineError> {
    let mut sources = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(PipelineError::from)
            .with_context(|| format!("reading {}", path.display()))?;
        let label = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        debug!("Loaded {} byte(s) from {}", bytes.len(), path.display());
        sources.push(SourceBatch::new(label, String::from_utf8_lossy(&bytes).into_owned()));
    }
    Ok(sources)
}

/// The export text for a set of records.
pub fn export(records: &[Record]) -> String {
    vcard::serialize_all(records)
}

/// Writes the export of `records` to `path`.
pub async fn write_export(path: &Path, records: &[Record]) -> Result<(), PipelineError> {
    tokio::fs::write(path, export(records))
        .await
        .map_err(PipelineError::from)
        .with_context(|| format!("writing {}", path.display()))?;
    info!("💾 Wrote {} record(s) to {}", records.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_thresholds_rejected() {
        let config = PipelineConfig {
            auto_merge_threshold: 0.5,
            review_threshold: 0.8,
            ..PipelineConfig::default()
        };
        assert!(matches!(in_memory(config), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_unknown_rule_rejected() {
        let config = PipelineConfig {
            quality_rules: vec!["spellcheck".to_string()],
            ..PipelineConfig::default()
        };
        assert!(in_memory(config).is_err());
    }

    #[test]
    fn test_empty_batch() {
        let pipeline = in_memory(PipelineConfig::default()).unwrap();
        let report = pipeline.run(Vec::new()).unwrap();
        assert!(report.active.is_empty());
        assert!(report.review.is_empty());
        assert_eq!(report.summary, BatchSummary::default());
    }

    #[test]
    fn test_rejected_records_excluded_from_active() {
        let pipeline = in_memory(PipelineConfig::default()).unwrap();
        let text = "BEGIN:VCARD\nVERSION:3.0\nFN:Ok Person\nN:Person;Ok;;;\nEND:VCARD\n\
                    BEGIN:VCARD\nVERSION:3.0\nFN:Bad\nN:Bad;;;;\nPHOTO;ENCODING=b;TYPE=JPEG:!!!notbase64\nEND:VCARD\n";
        let report = pipeline.run(vec![SourceBatch::new("crm", text)]).unwrap();
        assert_eq!(report.summary.imported, 2);
        assert_eq!(report.summary.rejected, 1);
        assert_eq!(report.active.len(), 1);
        assert_eq!(report.review.len(), 1);
        assert!(pipeline.audit().verify().is_ok());
    }

    #[test]
    fn test_rejected_record_stays_out_of_later_batches() {
        let pipeline = in_memory(PipelineConfig::default()).unwrap();
        let bad = "BEGIN:VCARD\nVERSION:3.0\nUID:bad\nFN:Bad\nN:Bad;;;;\nPHOTO;ENCODING=b;TYPE=JPEG:!!!notbase64\nEND:VCARD\n";
        let first = pipeline.run(vec![SourceBatch::new("crm", bad)]).unwrap();
        assert_eq!(first.summary.rejected, 1);
        assert!(first.active.is_empty());

        let good = "BEGIN:VCARD\nVERSION:3.0\nUID:good\nFN:Good Person\nN:Person;Good;;;\nEND:VCARD\n";
        let second = pipeline.run(vec![SourceBatch::new("crm", good)]).unwrap();
        let ids: Vec<&str> = second.active.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["good"]);
        assert_eq!(pipeline.store().get("bad").unwrap().status, crate::models::RecordStatus::Active);
    }
}
