//! Store interfaces the migration engine depends on, plus adapters.
//!
//! The engine only needs two capabilities from an index: paginated reads by
//! predicate ([`RecordSource`]) and bulk partial updates ([`BulkWriter`]).
//! Storage, replication and consistency stay on the store's side.

pub mod elastic;
pub mod memory;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::StoreError;
use crate::model::{Batch, Page, PageToken, ScanPredicate};

pub use elastic::ElasticStore;
pub use memory::{Fault, MemoryStore};

/// Future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Options attached to every bulk request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkOptions {
    /// Ask the store to make the writes visible to readers before answering.
    pub refresh: bool,
    /// Server-side deadline for the request.
    pub timeout: Duration,
}

/// Paginated read access.
pub trait RecordSource: Send + Sync {
    /// Fetch the page following `token` (`None` for the first page).
    fn fetch_page<'a>(
        &'a self,
        predicate: &'a ScanPredicate,
        token: Option<&'a PageToken>,
    ) -> StoreFuture<'a, Page>;
}

/// Bulk partial-update access.
pub trait BulkWriter: Send + Sync {
    /// Apply every operation of `batch`. Any per-item failure fails the call.
    fn bulk_apply<'a>(&'a self, batch: &'a Batch, options: BulkOptions) -> StoreFuture<'a, ()>;
}

/// A store offering both capabilities.
pub trait DocumentStore: RecordSource + BulkWriter {}

impl<T: RecordSource + BulkWriter + ?Sized> DocumentStore for T {}
