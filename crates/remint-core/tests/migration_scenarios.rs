//! End-to-end migration scenarios against the in-memory store.
//!
//! Covers the happy path with progress reporting, fail-fast accounting for
//! timeouts and store errors, idempotent re-runs, duplicate delivery, and the
//! no-op down hook.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use remint_core::Error;
use remint_core::config::{Config, MigrationSettings};
use remint_core::controller::{MigrationController, RunState};
use remint_core::error::{ApplyFailure, StoreError};
use remint_core::lifecycle::{Direction, EntityRetypeMigration, HookOutcome, Migration, run_hook};
use remint_core::model::{Batch, Page, PageToken, ScanPredicate};
use remint_core::progress::{Progress, ProgressSink, SinkError};
use remint_core::store::{BulkOptions, BulkWriter, Fault, MemoryStore, RecordSource, StoreFuture};

// =============================================================================
// Helpers
// =============================================================================

const LEGACY: &str = "X-OpenCTI-Incident";

fn settings(batch_size: usize, concurrency: usize) -> MigrationSettings {
    let mut config = Config::default();
    config.store.indices = vec!["sdo_*".into()];
    config.migration.max_batch_size = batch_size;
    config.migration.max_concurrency = concurrency;
    config.migration.bulk_timeout_secs = 30;
    config.settings().unwrap()
}

fn seeded(records: usize) -> MemoryStore {
    let store = MemoryStore::new().with_page_size(17);
    for i in 0..records {
        store.insert(
            format!("sdo_{}", i % 2),
            format!("r{i:04}"),
            json!({
                "entity_type": LEGACY,
                "parent_types": ["Basic-Object", "Stix-Domain-Object"],
                "name": format!("incident {i}"),
                "description": "legacy record",
            }),
        );
    }
    store.insert("sdo_0", "malware", json!({"entity_type": "Malware", "name": "m"}));
    store
}

#[derive(Default)]
struct RecordingSink {
    seen: Mutex<Vec<Progress>>,
}

impl RecordingSink {
    fn applied(&self) -> Vec<u64> {
        self.seen.lock().unwrap().iter().map(|p| p.applied).collect()
    }
}

impl ProgressSink for RecordingSink {
    fn on_progress(&self, progress: &Progress) -> Result<(), SinkError> {
        self.seen.lock().unwrap().push(*progress);
        Ok(())
    }
}

fn migrated(store: &MemoryStore) -> usize {
    store
        .snapshot()
        .values()
        .filter(|doc| doc.get("entity_type") == Some(&json!("Incident")))
        .count()
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn retypes_120_records_in_three_batches() {
    let store = Arc::new(seeded(120));
    let sink = Arc::new(RecordingSink::default());

    let summary = MigrationController::new(store.clone(), settings(50, 2))
        .with_progress_sink(sink.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.scanned, 120);
    assert_eq!(summary.total_operations, 120);
    assert_eq!(summary.applied_operations, 120);
    assert_eq!(summary.batches_total, 3);
    assert_eq!(summary.batches_applied, 3);

    let mut sizes: Vec<usize> = store.bulk_requests().iter().map(|r| r.operations).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, [20, 50, 50]);
    assert!(store.max_in_flight() <= 2);

    let applied = sink.applied();
    assert_eq!(applied.len(), 3);
    assert!(applied.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(applied.last(), Some(&120));
    assert!(sink.seen.lock().unwrap().iter().all(|p| p.total == 120));

    assert_eq!(migrated(&store), 120);
    let doc = store.document("sdo_0", "r0000").unwrap();
    assert_eq!(doc["description"], "legacy record");
    assert!(doc["standard_id"].as_str().unwrap().starts_with("incident--"));
    assert_eq!(store.document("sdo_0", "malware").unwrap()["entity_type"], "Malware");
}

#[tokio::test]
async fn every_bulk_request_asks_for_refresh() {
    let config = Config::from_toml(
        "[store]\nindices = [\"sdo_*\"]\n\n[migration]\nmax_batch_size = 40\nrefresh = false\n",
    )
    .unwrap();
    let store = Arc::new(seeded(100));

    MigrationController::new(store.clone(), config.settings().unwrap())
        .run()
        .await
        .unwrap();

    let requests = store.bulk_requests();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|r| r.options.refresh));
    assert!(requests.iter().all(|r| r.options.timeout == Duration::from_secs(300)));
}

#[tokio::test(start_paused = true)]
async fn concurrency_ceiling_holds_under_latency() {
    let store = Arc::new(seeded(200).with_write_latency(Duration::from_millis(50)));
    MigrationController::new(store.clone(), settings(10, 3))
        .run()
        .await
        .unwrap();
    assert_eq!(store.max_in_flight(), 3);
    assert_eq!(store.bulk_requests().len(), 20);
}

// =============================================================================
// Fail-fast
// =============================================================================

#[tokio::test(start_paused = true)]
async fn batch_timeout_fails_the_run_with_partial_progress() {
    let store = Arc::new(seeded(120));
    store.fault_batch(2, Fault::Hang);
    let sink = Arc::new(RecordingSink::default());

    let err = MigrationController::new(store.clone(), settings(50, 2))
        .with_progress_sink(sink.clone())
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.summary.state, RunState::Failed);
    assert_eq!(err.summary.total_operations, 120);
    // Batch 1 completes at once and its worker takes batch 3 while batch 2
    // is still pending; both count.
    assert_eq!(err.summary.batches_applied, 2);
    assert_eq!(err.summary.applied_operations, 70);
    assert_eq!(sink.applied().len(), 2);
    match &err.source {
        Error::Apply(apply) => {
            assert_eq!(apply.failed_batch, Some(2));
            assert!(matches!(apply.cause, ApplyFailure::Timeout(d) if d == Duration::from_secs(30)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(migrated(&store), 70);
    assert!(err.to_string().contains("70/120"));
}

#[tokio::test(start_paused = true)]
async fn first_failure_stops_scheduling_and_in_flight_batches_finish() {
    let store = Arc::new(seeded(200));
    store.fault_batch(1, Fault::Delay(Duration::from_millis(100)));
    store.fault_batch(
        2,
        Fault::FailAfter(
            Duration::from_millis(10),
            StoreError::Http {
                status: 503,
                body: "unavailable_shards_exception".into(),
            },
        ),
    );

    let err = MigrationController::new(store.clone(), settings(50, 2))
        .run()
        .await
        .unwrap_err();

    // k = 2, c = 2: applied lies in [(k-1-c)*50, (k-1)*50].
    assert_eq!(err.summary.batches_applied, 1);
    assert_eq!(err.summary.applied_operations, 50);
    let sent: Vec<usize> = store.bulk_requests().iter().map(|r| r.seq).collect();
    assert_eq!(sent, [1]);
    assert_eq!(migrated(&store), 50);
    assert!(err.source.remediation().is_some());
}

#[tokio::test]
async fn scan_failure_applies_nothing() {
    let store = Arc::new(seeded(60));
    store.fail_page(3, StoreError::Unavailable("connection refused".into()));

    let err = MigrationController::new(store.clone(), settings(50, 2))
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.summary.scanned, 34);
    assert_eq!(err.summary.applied_operations, 0);
    match &err.source {
        Error::Scan(scan) => {
            assert_eq!(scan.pages_read, 2);
            assert!(scan.source.is_transient());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(store.bulk_requests().is_empty());
    assert_eq!(migrated(&store), 0);
}

#[tokio::test]
async fn malformed_record_aborts_before_writing() {
    let store = Arc::new(seeded(30));
    store.insert("sdo_1", "r0003b", json!({"entity_type": LEGACY, "name": "   "}));

    let err = MigrationController::new(store.clone(), settings(50, 2))
        .run()
        .await
        .unwrap_err();

    match &err.source {
        Error::Derivation {
            location,
            record_id,
            ..
        } => {
            assert_eq!(location.as_str(), "sdo_1");
            assert_eq!(record_id.as_str(), "r0003b");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(store.bulk_requests().is_empty());
}

// =============================================================================
// Idempotence
// =============================================================================

#[tokio::test]
async fn second_run_changes_nothing() {
    let store = Arc::new(seeded(75));
    let controller = MigrationController::new(store.clone(), settings(20, 2));

    controller.run().await.unwrap();
    let once = store.snapshot();
    let second = controller.run().await.unwrap();

    assert_eq!(second.total_operations, 0);
    assert_eq!(store.snapshot(), once);
}

#[tokio::test(start_paused = true)]
async fn rerun_after_failure_converges_to_clean_run() {
    let clean = Arc::new(seeded(120));
    MigrationController::new(clean.clone(), settings(50, 2))
        .run()
        .await
        .unwrap();

    let store = Arc::new(seeded(120));
    store.fault_batch(2, Fault::Hang);
    let controller = MigrationController::new(store.clone(), settings(50, 2));
    controller.run().await.unwrap_err();

    store.clear_faults();
    let resumed = controller.run().await.unwrap();
    assert_eq!(resumed.total_operations, 50);
    assert_eq!(store.snapshot(), clean.snapshot());
}

// =============================================================================
// Duplicate delivery
// =============================================================================

/// Re-delivers the first record of every page on the next page.
struct StutteringStore {
    inner: MemoryStore,
    previous_first: Mutex<Option<remint_core::model::Record>>,
}

impl RecordSource for StutteringStore {
    fn fetch_page<'a>(
        &'a self,
        predicate: &'a ScanPredicate,
        token: Option<&'a PageToken>,
    ) -> StoreFuture<'a, Page> {
        Box::pin(async move {
            let mut page = self.inner.fetch_page(predicate, token).await?;
            let first = page.records.first().cloned();
            let mut previous = self.previous_first.lock().unwrap();
            if let Some(repeat) = previous.take() {
                page.records.push(repeat);
            }
            *previous = first;
            Ok(page)
        })
    }
}

impl BulkWriter for StutteringStore {
    fn bulk_apply<'a>(&'a self, batch: &'a Batch, options: BulkOptions) -> StoreFuture<'a, ()> {
        self.inner.bulk_apply(batch, options)
    }
}

#[tokio::test]
async fn duplicate_deliveries_yield_one_operation_each() {
    let store = Arc::new(StutteringStore {
        inner: seeded(50),
        previous_first: Mutex::new(None),
    });

    let summary = MigrationController::new(store.clone(), settings(50, 2))
        .run()
        .await
        .unwrap();

    // 50 matches over 3 pages of 17: two repeats.
    assert_eq!(summary.scanned, 52);
    assert_eq!(summary.duplicates_skipped, 2);
    assert_eq!(summary.total_operations, 50);
    assert_eq!(summary.applied_operations, 50);
    assert_eq!(migrated(&store.inner), 50);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn down_after_failed_up_leaves_index_unchanged() {
    let store = Arc::new(seeded(120));
    store.fault_batch(2, Fault::Hang);
    let migration = EntityRetypeMigration::new(MigrationController::new(
        store.clone(),
        settings(50, 2),
    ));

    let mut up = None;
    run_hook(&migration, Direction::Up, |result| up = Some(result)).await;
    let err = up.unwrap().unwrap_err();
    assert_eq!(err.summary.state, RunState::Failed);

    let after_up = store.snapshot();
    let fetches = store.fetch_count();
    let mut down = None;
    run_hook(&migration, Direction::Down, |result| down = Some(result)).await;

    assert!(matches!(down.unwrap().unwrap(), HookOutcome::Skipped { .. }));
    assert_eq!(store.snapshot(), after_up);
    assert_eq!(store.fetch_count(), fetches);
    assert_eq!(migration.name(), "migrate-incidents");
}

#[tokio::test]
async fn plan_matches_what_run_does() {
    let store = Arc::new(seeded(120));
    let controller = MigrationController::new(store.clone(), settings(50, 2));

    let plan = controller.plan().await.unwrap();
    assert_eq!(plan.operations, 120);
    assert_eq!(plan.batches, 3);
    assert_eq!(plan.per_location.values().sum::<u64>(), 120);
    assert!(store.bulk_requests().is_empty());

    let summary = controller.run().await.unwrap();
    assert_eq!(summary.total_operations, plan.operations);
    assert_eq!(summary.batches_total, plan.batches);
    for sample in &plan.sample {
        let doc = store.document(&sample.location, &sample.record_id).unwrap();
        assert_eq!(doc["standard_id"], sample.standard_id.as_str());
    }
}
