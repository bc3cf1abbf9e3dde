//! Migration controller: scan, build, split, apply.
//!
//! A run scans the index to completion, turning each page into update
//! operations as it arrives, then splits the operation list into batches and
//! hands them to the [`BatchApplier`]. Only the derived operations are kept
//! in memory, never the scanned documents.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};

use crate::applier::{ApplierConfig, BatchApplier};
use crate::batcher;
use crate::config::MigrationSettings;
use crate::derive::{IdDeriver, StandardIdDeriver};
use crate::error::Error;
use crate::model::{RecordKey, ScanPredicate, UpdateOperation};
use crate::operations::OperationBuilder;
use crate::progress::{LogProgressSink, ProgressSink};
use crate::scanner::{self, ScanStats};
use crate::store::DocumentStore;

/// Identifiers shown in a plan.
const PLAN_SAMPLE_SIZE: usize = 10;

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Completed,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of a run, including partial progress for failed runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    pub name: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Records delivered by the scan.
    pub scanned: u64,
    /// Records delivered more than once and skipped.
    pub duplicates_skipped: u64,
    pub total_operations: u64,
    pub applied_operations: u64,
    pub batches_total: usize,
    pub batches_applied: usize,
}

impl MigrationSummary {
    fn new(name: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            state: RunState::Failed,
            started_at,
            elapsed_ms: 0,
            scanned: 0,
            duplicates_skipped: 0,
            total_operations: 0,
            applied_operations: 0,
            batches_total: 0,
            batches_applied: 0,
        }
    }
}

/// A failed run: the cause plus everything that was done before it.
#[derive(Debug, thiserror::Error)]
#[error(
    "migration {} failed after applying {}/{} operations: {source}",
    .summary.name,
    .summary.applied_operations,
    .summary.total_operations
)]
pub struct MigrationError {
    pub summary: MigrationSummary,
    #[source]
    pub source: Error,
}

/// One sampled update in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedUpdate {
    pub location: String,
    pub record_id: String,
    pub standard_id: String,
}

/// What a run would do, computed without writing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationPlan {
    pub name: String,
    pub predicate: String,
    pub target_type: String,
    pub scanned: u64,
    pub duplicates_skipped: u64,
    pub operations: u64,
    pub batches: usize,
    pub max_batch_size: usize,
    /// Operations per store location.
    pub per_location: BTreeMap<String, u64>,
    pub sample: Vec<PlannedUpdate>,
}

/// Operations derived from a full scan.
#[derive(Debug, Default)]
struct Collected {
    operations: Vec<UpdateOperation>,
    stats: ScanStats,
    duplicates: u64,
}

/// Orchestrates one migration against a store.
pub struct MigrationController {
    settings: MigrationSettings,
    store: Arc<dyn DocumentStore>,
    builder: OperationBuilder,
    sink: Arc<dyn ProgressSink>,
}

impl fmt::Debug for MigrationController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationController")
            .field("settings", &self.settings)
            .field("builder", &self.builder)
            .finish_non_exhaustive()
    }
}

impl MigrationController {
    /// Controller using [`StandardIdDeriver`] and logging progress.
    pub fn new(store: Arc<dyn DocumentStore>, settings: MigrationSettings) -> Self {
        let builder = OperationBuilder::new(settings.target_type.clone(), Arc::new(StandardIdDeriver));
        let sink = Arc::new(LogProgressSink::new(settings.name.clone()));
        Self {
            settings,
            store,
            builder,
            sink,
        }
    }

    #[must_use]
    pub fn with_deriver(mut self, deriver: Arc<dyn IdDeriver>) -> Self {
        self.builder = OperationBuilder::new(self.settings.target_type.clone(), deriver);
        self
    }

    #[must_use]
    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn settings(&self) -> &MigrationSettings {
        &self.settings
    }

    #[must_use]
    pub fn predicate(&self) -> ScanPredicate {
        ScanPredicate::new(self.settings.indices.clone(), self.settings.source_types.clone())
    }

    /// Scan to completion and derive one operation per distinct record.
    async fn collect(&self, predicate: &ScanPredicate) -> Result<Collected, (Error, Collected)> {
        let mut collected = Collected::default();
        let mut seen: HashSet<RecordKey> = HashSet::new();
        let mut failure: Option<Error> = None;

        let scanned = scanner::scan(self.store.as_ref(), predicate, |records| {
            for record in records {
                if !seen.insert(record.key()) {
                    collected.duplicates += 1;
                    continue;
                }
                match self.builder.build_one(&record) {
                    Ok(op) => collected.operations.push(op),
                    Err(err) => {
                        failure = Some(err);
                        return ControlFlow::Break(());
                    }
                }
            }
            ControlFlow::Continue(())
        })
        .await;

        match scanned {
            Ok(stats) => collected.stats = stats,
            Err(err) => {
                collected.stats.pages = err.pages_read;
                collected.stats.records = err.records_read;
                return Err((err.into(), collected));
            }
        }
        if let Some(err) = failure {
            return Err((err, collected));
        }
        if collected.duplicates > 0 {
            warn!(duplicates = collected.duplicates, "skipped records delivered more than once");
        }
        Ok(collected)
    }

    /// Run the migration.
    pub async fn run(&self) -> Result<MigrationSummary, MigrationError> {
        let span = info_span!("migration", migration = %self.settings.name);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> Result<MigrationSummary, MigrationError> {
        let started = Instant::now();
        let mut summary = MigrationSummary::new(&self.settings.name, Utc::now());
        let predicate = self.predicate();
        info!(predicate = %predicate, target = %self.settings.target_type, "migration started");

        let collected = match self.collect(&predicate).await {
            Ok(collected) => collected,
            Err((source, partial)) => {
                summary.scanned = partial.stats.records;
                summary.duplicates_skipped = partial.duplicates;
                summary.elapsed_ms = started.elapsed().as_millis() as u64;
                warn!(error = %source, "migration failed before apply");
                return Err(MigrationError { summary, source });
            }
        };

        summary.scanned = collected.stats.records;
        summary.duplicates_skipped = collected.duplicates;
        summary.total_operations = collected.operations.len() as u64;

        let batches = batcher::split(collected.operations, self.settings.max_batch_size);
        summary.batches_total = batches.len();
        info!(
            operations = summary.total_operations,
            batches = summary.batches_total,
            "scan complete"
        );

        let applier = BatchApplier::new(
            Arc::clone(&self.store),
            ApplierConfig {
                concurrency: self.settings.concurrency,
                batch_timeout: self.settings.batch_timeout,
            },
        );
        let applied = applier.apply(batches, self.sink.as_ref(), started).await;
        summary.elapsed_ms = started.elapsed().as_millis() as u64;

        match applied {
            Ok(count) => {
                summary.state = RunState::Completed;
                summary.applied_operations = count.operations;
                summary.batches_applied = count.batches;
                info!(
                    applied = summary.applied_operations,
                    total = summary.total_operations,
                    elapsed_ms = summary.elapsed_ms,
                    "migration completed"
                );
                Ok(summary)
            }
            Err(err) => {
                summary.applied_operations = err.operations_applied;
                summary.batches_applied = err.batches_applied;
                warn!(
                    applied = summary.applied_operations,
                    total = summary.total_operations,
                    error = %err,
                    "migration failed"
                );
                Err(MigrationError {
                    summary,
                    source: err.into(),
                })
            }
        }
    }

    /// Scan and derive without writing anything.
    pub async fn plan(&self) -> crate::Result<MigrationPlan> {
        let predicate = self.predicate();
        let collected = self.collect(&predicate).await.map_err(|(err, _)| err)?;

        let mut per_location: BTreeMap<String, u64> = BTreeMap::new();
        for op in &collected.operations {
            *per_location
                .entry(op.target.location.to_string())
                .or_default() += 1;
        }
        let sample = collected
            .operations
            .iter()
            .take(PLAN_SAMPLE_SIZE)
            .map(|op| PlannedUpdate {
                location: op.target.location.to_string(),
                record_id: op.target.id.to_string(),
                standard_id: op.patch.standard_id.to_string(),
            })
            .collect();

        Ok(MigrationPlan {
            name: self.settings.name.clone(),
            predicate: predicate.to_string(),
            target_type: self.settings.target_type.clone(),
            scanned: collected.stats.records,
            duplicates_skipped: collected.duplicates,
            operations: collected.operations.len() as u64,
            batches: batcher::batch_count(collected.operations.len(), self.settings.max_batch_size),
            max_batch_size: self.settings.max_batch_size.get(),
            per_location,
            sample,
        })
    }
}
