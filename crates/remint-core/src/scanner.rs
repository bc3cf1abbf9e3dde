//! Index scanner: pulls every record matching a predicate, page by page.
//!
//! The pagination token is threaded explicitly through the loop and pages are
//! handed to the caller one at a time, so memory stays bounded by the page
//! size no matter how large the index is. Store errors are fatal here; there
//! is no retry at this layer.

use std::ops::ControlFlow;

use serde::Serialize;
use tracing::debug;

use crate::error::{ScanError, StoreError};
use crate::model::{PageToken, Record, ScanPredicate};
use crate::store::RecordSource;

/// Counters for a finished (or stopped) scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub pages: u64,
    pub records: u64,
    /// The page callback asked to stop before the index was exhausted.
    pub stopped_early: bool,
}

/// Fetch pages until the store reports no continuation, calling `on_page`
/// synchronously with each page's records.
///
/// `on_page` may return [`ControlFlow::Break`] to end the scan early; the
/// scan then returns `Ok` with `stopped_early` set.
pub async fn scan<S, F>(
    source: &S,
    predicate: &ScanPredicate,
    mut on_page: F,
) -> Result<ScanStats, ScanError>
where
    S: RecordSource + ?Sized,
    F: FnMut(Vec<Record>) -> ControlFlow<()>,
{
    let mut stats = ScanStats::default();
    let mut token: Option<PageToken> = None;

    loop {
        let page = source
            .fetch_page(predicate, token.as_ref())
            .await
            .map_err(|source| ScanError {
                pages_read: stats.pages,
                records_read: stats.records,
                source,
            })?;

        stats.pages += 1;
        stats.records += page.records.len() as u64;
        debug!(
            page = stats.pages,
            records = page.records.len(),
            total = stats.records,
            "scanned page"
        );

        let exhausted = page.records.is_empty();
        let next = page.next;
        if on_page(page.records).is_break() {
            stats.stopped_early = true;
            return Ok(stats);
        }

        match next {
            None => return Ok(stats),
            Some(_) if exhausted => return Ok(stats),
            Some(next) if token.as_ref() == Some(&next) => {
                return Err(ScanError {
                    pages_read: stats.pages,
                    records_read: stats.records,
                    source: StoreError::InvalidResponse(
                        "pagination token did not advance".to_string(),
                    ),
                });
            }
            Some(next) => token = Some(next),
        }
    }
}
