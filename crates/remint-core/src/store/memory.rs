//! In-memory document store.
//!
//! Holds documents per index in sorted maps so pagination is deterministic:
//! records are returned in `(index, id)` order and the page token is the key
//! of the last record delivered. Writes are visible immediately, so the
//! refresh flag is recorded but has no further effect.
//!
//! Faults and latency can be injected per batch or per page fetch, which is
//! how the engine's failure and concurrency behaviour is exercised.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Map, Value, json};

use super::{BulkOptions, BulkWriter, RecordSource, StoreFuture};
use crate::error::StoreError;
use crate::model::{Batch, Page, PageToken, Record, ScanPredicate};

/// Default number of records per page.
pub const DEFAULT_MEMORY_PAGE_SIZE: usize = 100;

/// Injected behaviour for a bulk request.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail immediately.
    Fail(StoreError),
    /// Fail after the given delay.
    FailAfter(Duration, StoreError),
    /// Succeed after the given delay.
    Delay(Duration),
    /// Never answer.
    Hang,
}

/// A bulk request as received by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkRequestLog {
    pub seq: usize,
    pub operations: usize,
    pub options: BulkOptions,
}

#[derive(Debug, Default)]
struct Inner {
    indices: BTreeMap<String, BTreeMap<String, Map<String, Value>>>,
    batch_faults: HashMap<usize, Fault>,
    page_faults: HashMap<u64, StoreError>,
    fetches: u64,
    bulk_requests: Vec<BulkRequestLog>,
}

/// Thread-safe in-memory store implementing [`RecordSource`] and [`BulkWriter`].
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    page_size: usize,
    write_latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct FlightGuard<'a> {
    in_flight: &'a AtomicUsize,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            page_size: DEFAULT_MEMORY_PAGE_SIZE,
            write_latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Records per page (minimum 1).
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Delay applied to every bulk request before it is processed.
    #[must_use]
    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = latency;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace a document. Non-object values are stored as empty documents.
    pub fn insert(&self, index: impl Into<String>, id: impl Into<String>, content: Value) {
        let content = match content {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.lock()
            .indices
            .entry(index.into())
            .or_default()
            .insert(id.into(), content);
    }

    /// Make the `nth` page fetch (1-indexed, counted over the store's lifetime) fail.
    pub fn fail_page(&self, nth: u64, error: StoreError) {
        self.lock().page_faults.insert(nth, error);
    }

    /// Inject behaviour for the bulk request carrying batch `seq`.
    pub fn fault_batch(&self, seq: usize, fault: Fault) {
        self.lock().batch_faults.insert(seq, fault);
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        let mut inner = self.lock();
        inner.batch_faults.clear();
        inner.page_faults.clear();
    }

    #[must_use]
    pub fn document(&self, index: &str, id: &str) -> Option<Map<String, Value>> {
        self.lock()
            .indices
            .get(index)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Copy of every document keyed by `(index, id)`.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<(String, String), Map<String, Value>> {
        let inner = self.lock();
        inner
            .indices
            .iter()
            .flat_map(|(index, docs)| {
                docs.iter()
                    .map(move |(id, doc)| ((index.clone(), id.clone()), doc.clone()))
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().indices.values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bulk requests that reached the write stage, in arrival order.
    #[must_use]
    pub fn bulk_requests(&self) -> Vec<BulkRequestLog> {
        self.lock().bulk_requests.clone()
    }

    /// Number of page fetches served (including failed ones).
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.lock().fetches
    }

    /// Highest number of bulk requests observed in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter_flight(&self) -> FlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        FlightGuard {
            in_flight: &self.in_flight,
        }
    }

    fn read_page(
        &self,
        predicate: &ScanPredicate,
        token: Option<&PageToken>,
    ) -> Result<Page, StoreError> {
        let mut inner = self.lock();
        inner.fetches += 1;
        let nth = inner.fetches;
        if let Some(err) = inner.page_faults.remove(&nth) {
            return Err(err);
        }

        let after: Option<(String, String)> = token
            .map(|t| serde_json::from_value(t.0.clone()))
            .transpose()
            .map_err(|e| StoreError::InvalidResponse(format!("bad page token: {e}")))?;

        let mut records = Vec::with_capacity(self.page_size);
        'indices: for (index, docs) in &inner.indices {
            if !predicate.covers(index) {
                continue;
            }
            for (id, content) in docs {
                if let Some((after_index, after_id)) = &after {
                    if (index, id) <= (after_index, after_id) {
                        continue;
                    }
                }
                if !predicate.matches_content(content) {
                    continue;
                }
                records.push(Record::new(index.clone(), id.clone(), content.clone()));
                if records.len() == self.page_size {
                    break 'indices;
                }
            }
        }

        let next = if records.len() == self.page_size {
            records
                .last()
                .map(|r| PageToken(json!([r.location.as_str(), r.id.as_str()])))
        } else {
            None
        };
        Ok(Page { records, next })
    }

    fn write_batch(&self, batch: &Batch, options: BulkOptions) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.bulk_requests.push(BulkRequestLog {
            seq: batch.seq(),
            operations: batch.len(),
            options,
        });

        // Items are independent, like a real bulk endpoint: apply what can be
        // applied and report the first rejection.
        let mut first_rejection = None;
        for op in batch.operations() {
            let doc = inner
                .indices
                .get_mut(op.target.location.as_str())
                .and_then(|docs| docs.get_mut(op.target.id.as_str()));
            match doc {
                Some(doc) => {
                    for (field, value) in op.patch.to_doc() {
                        doc.insert(field, value);
                    }
                }
                None => {
                    first_rejection.get_or_insert_with(|| StoreError::Rejected {
                        location: op.target.location.to_string(),
                        record_id: op.target.id.to_string(),
                        reason: "document missing".to_string(),
                    });
                }
            }
        }
        first_rejection.map_or(Ok(()), Err)
    }
}

impl RecordSource for MemoryStore {
    fn fetch_page<'a>(
        &'a self,
        predicate: &'a ScanPredicate,
        token: Option<&'a PageToken>,
    ) -> StoreFuture<'a, Page> {
        Box::pin(async move { self.read_page(predicate, token) })
    }
}

impl BulkWriter for MemoryStore {
    fn bulk_apply<'a>(&'a self, batch: &'a Batch, options: BulkOptions) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let _flight = self.enter_flight();
            let fault = self.lock().batch_faults.get(&batch.seq()).cloned();

            if !self.write_latency.is_zero() {
                tokio::time::sleep(self.write_latency).await;
            }
            match fault {
                Some(Fault::Fail(err)) => return Err(err),
                Some(Fault::FailAfter(delay, err)) => {
                    tokio::time::sleep(delay).await;
                    return Err(err);
                }
                Some(Fault::Delay(delay)) => tokio::time::sleep(delay).await,
                Some(Fault::Hang) => std::future::pending::<()>().await,
                None => {}
            }

            self.write_batch(batch, options)
        })
    }
}
