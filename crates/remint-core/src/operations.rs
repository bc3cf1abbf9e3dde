//! Turns scanned records into partial-update operations.

use std::sync::Arc;

use crate::derive::IdDeriver;
use crate::error::{Error, Result};
use crate::model::{Patch, Record, UpdateOperation};

/// Builds one [`UpdateOperation`] per record, retyping it to `target_type`
/// and attaching the identifier derived from its content.
#[derive(Clone)]
pub struct OperationBuilder {
    target_type: String,
    deriver: Arc<dyn IdDeriver>,
}

impl std::fmt::Debug for OperationBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationBuilder")
            .field("target_type", &self.target_type)
            .finish_non_exhaustive()
    }
}

impl OperationBuilder {
    #[must_use]
    pub fn new(target_type: impl Into<String>, deriver: Arc<dyn IdDeriver>) -> Self {
        Self {
            target_type: target_type.into(),
            deriver,
        }
    }

    /// Operation for a single record.
    pub fn build_one(&self, record: &Record) -> Result<UpdateOperation> {
        let standard_id = self
            .deriver
            .derive(&self.target_type, &record.content)
            .map_err(|source| Error::Derivation {
                location: record.location.clone(),
                record_id: record.id.clone(),
                source,
            })?;
        Ok(UpdateOperation {
            target: record.key(),
            patch: Patch {
                entity_type: self.target_type.clone(),
                standard_id,
            },
        })
    }

    /// Operations for `records`, in input order. Stops at the first record
    /// whose identifier cannot be derived.
    pub fn build(&self, records: &[Record]) -> Result<Vec<UpdateOperation>> {
        records.iter().map(|record| self.build_one(record)).collect()
    }
}
