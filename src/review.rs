use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::importer::ImportFailure;
use crate::merge::MergePlan;
use crate::models::RecordId;
use crate::rewriter::QualityReport;
use crate::scoring::MatchCandidate;
use crate::validator::ValidationFinding;

/// Why a scored pair needs a human decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidateReason {
    /// Score in the band between the review and auto-merge thresholds.
    Ambiguous,
    /// Would have been reviewed or merged, but negative evidence pulled it down.
    DownWeighted,
}

/// Something the pipeline could not settle on its own, with its evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ReviewItem {
    /// Still structurally invalid after repair.
    RejectedRecord {
        record_id: RecordId,
        findings: Vec<ValidationFinding>,
    },
    /// Input that never became a record.
    ParseFailure { failure: ImportFailure },
    MatchCandidate {
        reason: CandidateReason,
        candidate: MatchCandidate,
    },
    /// A merge that was rolled back as a whole.
    RolledBackCluster {
        plan: MergePlan,
        reason: String,
        findings: Vec<ValidationFinding>,
    },
    /// A rewrite that made the record worse and was thrown away.
    RewriteDiscarded { report: QualityReport },
}

impl ReviewItem {
    pub fn kind(&self) -> &'static str {
        match self {
            ReviewItem::RejectedRecord { .. } => "rejected-record",
            ReviewItem::ParseFailure { .. } => "parse-failure",
            ReviewItem::MatchCandidate { .. } => "match-candidate",
            ReviewItem::RolledBackCluster { .. } => "rolled-back-cluster",
            ReviewItem::RewriteDiscarded { .. } => "rewrite-discarded",
        }
    }

    /// Records the item is about.
    pub fn record_ids(&self) -> Vec<RecordId> {
        match self {
            ReviewItem::RejectedRecord { record_id, .. } => vec![record_id.clone()],
            ReviewItem::ParseFailure { .. } => Vec::new(),
            ReviewItem::MatchCandidate { candidate, .. } => {
                vec![candidate.record_a.clone(), candidate.record_b.clone()]
            }
            ReviewItem::RolledBackCluster { plan, .. } => plan.member_ids(),
            ReviewItem::RewriteDiscarded { report } => vec![report.record_id.clone()],
        }
    }
}

/// Collects review items from concurrent stages.
#[derive(Debug, Default)]
pub struct ReviewQueue {
    items: Mutex<Vec<ReviewItem>>,
}

impl ReviewQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: ReviewItem) {
        // a poisoned queue still holds every item pushed before the panic
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.push(item);
    }

    pub fn extend(&self, new_items: impl IntoIterator<Item = ReviewItem>) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.extend(new_items);
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, kind: &str) -> usize {
        self.items
            .lock()
            .map(|i| i.iter().filter(|item| item.kind() == kind).count())
            .unwrap_or(0)
    }

    /// Takes every queued item, oldest first.
    pub fn drain(&self) -> Vec<ReviewItem> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_counts_and_drains() {
        let queue = ReviewQueue::new();
        queue.push(ReviewItem::RejectedRecord {
            record_id: "a".to_string(),
            findings: Vec::new(),
        });
        queue.extend(vec![ReviewItem::ParseFailure {
            failure: ImportFailure {
                source: "crm".to_string(),
                index: 2,
                reason: "missing END:VCARD".to_string(),
                raw: "BEGIN:VCARD".to_string(),
            },
        }]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.count("parse-failure"), 1);

        let items = queue.drain();
        assert_eq!(items[0].record_ids(), vec!["a".to_string()]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_items_serialize_with_kind_tag() {
        let item = ReviewItem::RejectedRecord {
            record_id: "a".to_string(),
            findings: Vec::new(),
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["kind"], "rejected-record");
        assert_eq!(json["record_id"], "a");
    }
}
