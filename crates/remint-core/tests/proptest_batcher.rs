//! Property-based tests for batching and operation building.
//!
//! Covers the batch size bound, order preservation, sequence numbering and
//! one-operation-per-record completeness.

use std::num::NonZeroUsize;
use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;

use remint_core::batcher::{batch_count, split};
use remint_core::derive::{Identifier, StandardIdDeriver};
use remint_core::model::{Patch, Record, RecordId, RecordKey, StoreLocation, UpdateOperation};
use remint_core::operations::OperationBuilder;

// =============================================================================
// Strategies
// =============================================================================

fn arb_operations() -> impl Strategy<Value = Vec<UpdateOperation>> {
    (0usize..400).prop_map(|n| {
        (0..n)
            .map(|i| UpdateOperation {
                target: RecordKey {
                    location: StoreLocation::new(format!("idx_{}", i % 3)),
                    id: RecordId::new(format!("r{i}")),
                },
                patch: Patch {
                    entity_type: "Incident".into(),
                    standard_id: Identifier::new(format!("incident--{i}")),
                },
            })
            .collect()
    })
}

fn arb_batch_size() -> impl Strategy<Value = NonZeroUsize> {
    (1usize..=120).prop_map(|n| NonZeroUsize::new(n).unwrap())
}

fn arb_names() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-zA-Z0-9][a-zA-Z0-9 ]{0,23}", 0..60)
}

// =============================================================================
// Batcher
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every batch holds at most the bound; only the last may be short.
    #[test]
    fn batches_respect_bound(ops in arb_operations(), size in arb_batch_size()) {
        let batches = split(ops.clone(), size);
        let last = batches.len().saturating_sub(1);
        for (i, batch) in batches.iter().enumerate() {
            prop_assert!(batch.len() <= size.get());
            prop_assert!(!batch.is_empty());
            if i < last {
                prop_assert_eq!(batch.len(), size.get());
            }
        }
        prop_assert_eq!(batches.len(), batch_count(ops.len(), size));
    }

    /// Concatenating the batches gives back the input in order.
    #[test]
    fn batches_preserve_order(ops in arb_operations(), size in arb_batch_size()) {
        let flat: Vec<UpdateOperation> = split(ops.clone(), size)
            .into_iter()
            .flat_map(|b| b.operations().to_vec())
            .collect();
        prop_assert_eq!(flat, ops);
    }

    /// Sequence numbers are 1..=n in submission order.
    #[test]
    fn batches_are_numbered(ops in arb_operations(), size in arb_batch_size()) {
        let seqs: Vec<usize> = split(ops, size).iter().map(|b| b.seq()).collect();
        let expected: Vec<usize> = (1..=seqs.len()).collect();
        prop_assert_eq!(seqs, expected);
    }
}

// =============================================================================
// Operation builder
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Exactly one operation per record, same order, same targets.
    #[test]
    fn one_operation_per_record(names in arb_names()) {
        let records: Vec<Record> = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let content = json!({"entity_type": "X-OpenCTI-Incident", "name": name});
                Record::new("sdo", format!("r{i}"), content.as_object().cloned().unwrap())
            })
            .collect();
        let builder = OperationBuilder::new("Incident", Arc::new(StandardIdDeriver));
        let ops = builder.build(&records).unwrap();

        prop_assert_eq!(ops.len(), records.len());
        for (op, record) in ops.iter().zip(&records) {
            prop_assert_eq!(&op.target, &record.key());
            prop_assert_eq!(op.patch.entity_type.as_str(), "Incident");
        }
    }
}
