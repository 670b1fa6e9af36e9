use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use contact_compliance::audit::{AuditLog, Operation};
use contact_compliance::circuit_breaker::create_store_circuit_breaker;
use contact_compliance::config::PipelineConfig;
use contact_compliance::errors::{PipelineError, StoreError};
use contact_compliance::importer::SourceBatch;
use contact_compliance::models::{Record, RecordStatus};
use contact_compliance::pipeline::{self, load_sources, write_export, Pipeline};
use contact_compliance::review::ReviewItem;
use contact_compliance::storage::{MemoryStore, RecordStore, VersionedWrite};

/// Memory store that refuses any commit flipping a record to `merged` while `fail_merges` is set.
#[derive(Default)]
struct FailingMergeStore {
    inner: MemoryStore,
    fail_merges: AtomicBool,
    refused: AtomicUsize,
}

impl RecordStore for FailingMergeStore {
    fn insert_new(&self, record: Record) -> Result<(), StoreError> {
        self.inner.insert_new(record)
    }

    fn get(&self, id: &str) -> Result<Record, StoreError> {
        self.inner.get(id)
    }

    fn commit(&self, writes: Vec<VersionedWrite>) -> Result<(), StoreError> {
        let merging = writes.iter().any(|w| w.record.status == RecordStatus::Merged);
        if merging && self.fail_merges.load(Ordering::SeqCst) {
            self.refused.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }
        self.inner.commit(writes)
    }

    fn active(&self) -> Result<Vec<Record>, StoreError> {
        self.inner.active()
    }

    fn all(&self) -> Result<Vec<Record>, StoreError> {
        self.inner.all()
    }
}

fn duplicate_pair(uid_a: &str, uid_b: &str, email: &str) -> String {
    [uid_a, uid_b]
        .iter()
        .map(|uid| {
            format!(
                "BEGIN:VCARD\r\nVERSION:3.0\r\nUID:{}\r\nFN:Chris Xu\r\nN:Xu;Chris;;;\r\nEMAIL:{}\r\nEND:VCARD\r\n",
                uid, email
            )
        })
        .collect()
}

fn failing_pipeline(
    threshold: u32,
) -> (
    Arc<FailingMergeStore>,
    Pipeline<impl failsafe::CircuitBreaker + Send + Sync>,
) {
    let store = Arc::new(FailingMergeStore::default());
    store.fail_merges.store(true, Ordering::SeqCst);
    let config = PipelineConfig {
        worker_threads: 1,
        store_failure_threshold: threshold,
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::new(
        config,
        store.clone(),
        Arc::new(AuditLog::new()),
        create_store_circuit_breaker(threshold),
    )
    .unwrap();
    (store, pipeline)
}

#[test]
fn failed_merge_commit_changes_nothing() {
    let (store, pipeline) = failing_pipeline(5);
    let text = duplicate_pair("a1", "a2", "c@x.com");
    let report = pipeline.run(vec![SourceBatch::new("crm", text)]).unwrap();

    assert_eq!(store.refused.load(Ordering::SeqCst), 1);
    assert_eq!(report.summary.rollbacks, 1);
    assert_eq!(report.summary.clusters_merged, 0);
    assert_eq!(report.active.len(), 2);
    for record in store.all().unwrap() {
        assert_eq!(record.status, RecordStatus::Active);
        assert_eq!(record.merged_into, None);
    }
    assert!(pipeline
        .audit()
        .events()
        .iter()
        .all(|e| e.operation != Operation::MergeSurvivor && e.operation != Operation::MergeAbsorb));
    assert!(report
        .review
        .iter()
        .any(|i| matches!(i, ReviewItem::RolledBackCluster { reason, .. } if reason.contains("simulated outage"))));
}

#[test]
fn open_breaker_aborts_the_batch() {
    let (store, pipeline) = failing_pipeline(1);
    let text = duplicate_pair("a1", "a2", "c@x.com") + &duplicate_pair("b1", "b2", "d@y.com");
    let result = pipeline.run(vec![SourceBatch::new("crm", text)]);

    let err = result.expect_err("second cluster should hit the open breaker");
    assert!(err.is_fatal());
    assert!(matches!(err.root(), PipelineError::ResourceExhausted(_)));
    assert_eq!(store.refused.load(Ordering::SeqCst), 1);
    assert!(store
        .all()
        .unwrap()
        .iter()
        .all(|r| r.status == RecordStatus::Active));
}

#[test]
fn recovered_store_merges_on_next_batch() {
    let (store, pipeline) = failing_pipeline(5);
    let first = pipeline
        .run(vec![SourceBatch::new("crm", duplicate_pair("a1", "a2", "c@x.com"))])
        .unwrap();
    assert_eq!(first.summary.rollbacks, 1);

    store.fail_merges.store(false, Ordering::SeqCst);
    let second = pipeline.run(Vec::new()).unwrap();
    assert_eq!(second.summary.clusters_merged, 1);
    assert_eq!(second.active.len(), 1);
    assert!(pipeline.audit().verify().is_ok());
}

#[test]
fn reimported_uid_is_rekeyed() {
    let pipeline = pipeline::in_memory(PipelineConfig::default()).unwrap();
    let card = "BEGIN:VCARD\r\nVERSION:3.0\r\nUID:same\r\nFN:Ann Lee\r\nN:Lee;Ann;;;\r\nEND:VCARD\r\n";
    pipeline.run(vec![SourceBatch::new("a", card)]).unwrap();
    pipeline.run(vec![SourceBatch::new("b", card)]).unwrap();

    let all = pipeline.store().all().unwrap();
    assert_eq!(all.len(), 2);
    let rekeyed = all.iter().find(|r| r.id != "same").unwrap();
    assert!(rekeyed.extra.iter().any(|p| p.name == "X-SOURCE-UID" && p.value == "same"));
}

#[tokio::test]
async fn load_sources_labels_by_file_stem() {
    let dir = tempfile::tempdir().unwrap();
    let phone = dir.path().join("phone-export.vcf");
    let crm = dir.path().join("crm.vcf");
    tokio::fs::write(&phone, "BEGIN:VCARD\r\nFN:A\r\nEND:VCARD\r\n").await.unwrap();
    tokio::fs::write(&crm, "BEGIN:VCARD\r\nFN:B\r\nEND:VCARD\r\n").await.unwrap();

    let sources = load_sources(&[phone, crm]).await.unwrap();
    let labels: Vec<&str> = sources.iter().map(|s| s.source.as_str()).collect();
    assert_eq!(labels, vec!["phone-export", "crm"]);
    assert!(sources[1].text.contains("FN:B"));
}

#[tokio::test]
async fn load_sources_reports_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.vcf");
    let err = load_sources(&[missing]).await.unwrap_err();
    assert!(matches!(err.root(), PipelineError::Io(_)));
    assert!(err.to_string().contains("nope.vcf"));
}

#[tokio::test]
async fn export_file_reimports_to_same_records() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("crm.vcf");
    let output = dir.path().join("out.vcf");
    tokio::fs::write(&input, duplicate_pair("a1", "a2", "c@x.com"))
        .await
        .unwrap();

    let sources = load_sources(&[input]).await.unwrap();
    let report = tokio::task::spawn_blocking(move || {
        pipeline::in_memory(PipelineConfig::default())?.run(sources)
    })
    .await
    .unwrap()
    .unwrap();
    write_export(&output, &report.active).await.unwrap();

    let reloaded = load_sources(&[output]).await.unwrap();
    let again = pipeline::in_memory(PipelineConfig::default())
        .unwrap()
        .run(reloaded)
        .unwrap();
    assert_eq!(again.active.len(), 1);
    assert_eq!(again.active[0].id, report.active[0].id);
    assert_eq!(again.active[0].emails, report.active[0].emails);
}
