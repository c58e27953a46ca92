//! Cancellation and resumption of harvest jobs.
//!
//! Runs under paused tokio time so the scripted delays are deterministic.

use std::time::Duration;

use gleaner_core::{HarvestPipeline, SilentReporter};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::integration::common::{
    MockCatalog, MockFactory, MockImporter, MockLedger, ids, source,
};

fn guids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("rec-{:02}", i)).collect()
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_start_writes_nothing() {
    let catalog = MockCatalog::new(ids(&["a", "b"]));
    let ledger = MockLedger::new();
    let pipeline = HarvestPipeline::new(
        MockFactory::new(catalog.clone()),
        ledger.clone(),
        MockImporter::new(),
    );

    let token = CancellationToken::new();
    token.cancel();
    let result = pipeline
        .run_job_cancellable(Uuid::new_v4(), &source(), &SilentReporter, token)
        .await;

    assert!(result.cancelled);
    assert!(result.fatal.is_none());
    assert!(ledger.all_entries().is_empty());
    assert_eq!(catalog.total_fetch_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_gather_writes_nothing() {
    let catalog = MockCatalog::new(ids(&["a", "b", "c", "d"]))
        .with_list_delay(Duration::from_millis(50));
    let ledger = MockLedger::new();
    let pipeline = HarvestPipeline::new(
        MockFactory::new(catalog.clone()),
        ledger.clone(),
        MockImporter::new(),
    );
    let token = CancellationToken::new();
    let job_id = Uuid::new_v4();
    let src = source();

    let (result, _) = tokio::join!(
        pipeline.run_job_cancellable(job_id, &src, &SilentReporter, token.clone()),
        async {
            sleep(Duration::from_millis(120)).await;
            token.cancel();
        }
    );

    assert!(result.cancelled);
    assert!(ledger.all_entries().is_empty());

    // The job gathers from scratch next time.
    let result = pipeline.run_job(job_id, &src).await;
    assert!(!result.resumed);
    assert_eq!(result.fetched_ok, 4);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_fetch_then_resume() {
    let guids = guids(10);
    let refs: Vec<&str> = guids.iter().map(String::as_str).collect();
    let catalog = MockCatalog::new(ids(&refs)).with_fetch_delay(Duration::from_millis(50));
    let ledger = MockLedger::new();
    let importer = MockImporter::new();
    let factory = MockFactory::new(catalog.clone());
    let pipeline = HarvestPipeline::new(factory.clone(), ledger.clone(), importer.clone());
    let token = CancellationToken::new();
    let job_id = Uuid::new_v4();
    let src = source();

    let (first, _) = tokio::join!(
        pipeline.run_job_cancellable(job_id, &src, &SilentReporter, token.clone()),
        async {
            sleep(Duration::from_millis(120)).await;
            token.cancel();
        }
    );

    assert!(first.cancelled);
    assert_eq!(first.new, 10);
    assert!(first.fetched_ok >= 1 && first.fetched_ok < 10);
    assert_eq!(first.fetched_ok, importer.calls().len());

    let entries = ledger.all_entries();
    assert_eq!(entries.len(), 10);
    let pending = entries.iter().filter(|e| e.is_pending()).count();
    assert_eq!(pending, 10 - first.fetched_ok);

    // The catalog changing in between must not matter: resume never re-gathers.
    catalog.set_listing(ids(&["something-else"]));

    let second = pipeline.run_job(job_id, &src).await;

    assert!(second.resumed);
    assert!(!second.cancelled);
    assert_eq!(second.fetched_ok, pending);
    assert_eq!(first.fetched_ok + second.fetched_ok, 10);
    assert_eq!(ledger.all_entries().len(), 10);
    for guid in &guids {
        assert_eq!(catalog.primary_calls(guid), 1, "{} fetched twice", guid);
    }
    assert_eq!(importer.calls().len(), 10);
}

#[tokio::test]
async fn test_rerunning_finished_job_is_noop() {
    let catalog = MockCatalog::new(ids(&["a", "b"]));
    let ledger = MockLedger::new();
    let importer = MockImporter::new();
    let factory = MockFactory::new(catalog.clone());
    let pipeline = HarvestPipeline::new(factory.clone(), ledger.clone(), importer.clone());
    let job_id = Uuid::new_v4();

    pipeline.run_job(job_id, &source()).await;
    let connects = factory.connects();

    let again = pipeline.run_job(job_id, &source()).await;

    assert!(again.resumed);
    assert_eq!(again.fetched_total(), 0);
    assert_eq!(again.imported, 0);
    assert_eq!(factory.connects(), connects);
    assert_eq!(importer.calls().len(), 2);
    assert_eq!(ledger.all_entries().len(), 2);
}

#[tokio::test]
async fn test_persist_failure_leaves_entry_pending_for_resume() {
    let catalog = MockCatalog::new(ids(&["a"]));
    let ledger = MockLedger::new();
    let importer = MockImporter::new();
    let pipeline = HarvestPipeline::new(
        MockFactory::new(catalog.clone()),
        ledger.clone(),
        importer.clone(),
    );
    let job_id = Uuid::new_v4();

    ledger.set_fail_record_fetch(true);
    let first = pipeline.run_job(job_id, &source()).await;
    assert_eq!(first.fetched_failed, 1);
    assert!(ledger.job_entry(job_id, "a").unwrap().is_pending());
    assert!(importer.calls().is_empty());

    ledger.set_fail_record_fetch(false);
    let second = pipeline.run_job(job_id, &source()).await;
    assert!(second.resumed);
    assert_eq!(second.fetched_ok, 1);
    assert!(ledger.job_entry(job_id, "a").unwrap().content.is_some());
}

#[tokio::test]
async fn test_resume_with_connect_failure_keeps_entries() {
    let catalog = MockCatalog::new(ids(&["a"]));
    let ledger = MockLedger::new();
    let factory = MockFactory::new(catalog.clone());
    let pipeline = HarvestPipeline::new(factory.clone(), ledger.clone(), MockImporter::new());
    let job_id = Uuid::new_v4();

    ledger.set_fail_record_fetch(true);
    pipeline.run_job(job_id, &source()).await;
    ledger.set_fail_record_fetch(false);

    factory.set_fail_connect(true);
    let result = pipeline.run_job(job_id, &source()).await;

    assert!(result.resumed);
    assert_eq!(result.fatal.as_ref().map(|f| f.reason()), Some("connect_error"));
    assert!(ledger.job_entry(job_id, "a").unwrap().is_pending());
}
