//! Splits the operation list into bulk-request sized batches.

use std::num::NonZeroUsize;

use crate::model::{Batch, UpdateOperation};

/// Split `ops` into contiguous batches of at most `max_batch_size`, keeping
/// order. Only the last batch may be smaller. Batches are numbered from 1 in
/// submission order.
#[must_use]
pub fn split(ops: Vec<UpdateOperation>, max_batch_size: NonZeroUsize) -> Vec<Batch> {
    let size = max_batch_size.get();
    let mut batches = Vec::with_capacity(ops.len().div_ceil(size));
    let mut rest = ops.into_iter().peekable();
    while rest.peek().is_some() {
        let chunk: Vec<_> = rest.by_ref().take(size).collect();
        batches.push(Batch::new(batches.len() + 1, chunk));
    }
    batches
}

/// Number of batches `split` would produce.
#[must_use]
pub fn batch_count(operations: usize, max_batch_size: NonZeroUsize) -> usize {
    operations.div_ceil(max_batch_size.get())
}
