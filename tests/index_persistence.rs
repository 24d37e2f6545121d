//! Persistence laws for the vector index: save/load reproduces query
//! results, and upsert-remove-upsert behaves like a single upsert.

use intent_mediator::types::{Intent, IntentStatus};
use intent_mediator::VectorIndex;
use proptest::prelude::*;
use tempfile::TempDir;

fn intent(fingerprint: &str, seq: i64) -> Intent {
    Intent {
        fingerprint: fingerprint.to_string(),
        author: "prop".to_string(),
        prose: format!("intent number {seq}"),
        desires: vec![],
        constraints: vec![],
        offered_fee: Some(seq as f64),
        timestamp: seq,
        status: IntentStatus::Pending,
    }
}

/// Unit-ish random vectors: components bounded away from all-zero.
fn vector_strategy() -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-1.0f32..1.0, 8).prop_map(|mut v| {
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm < 1e-3 {
            v[0] = 1.0;
        }
        v
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn save_then_load_reproduces_queries(vectors in prop::collection::vec(vector_strategy(), 2..12)) {
        let dir = TempDir::new().unwrap();
        let mut index = VectorIndex::initialize(dir.path(), 1_000, 8, 0.0).unwrap();
        for (i, v) in vectors.iter().enumerate() {
            index.upsert(&intent(&format!("intent-prop-{i:04}"), i as i64), v).unwrap();
        }
        let before: Vec<_> = vectors
            .iter()
            .map(|v| index.query_top_k(v, 3, None))
            .collect();
        index.save().unwrap();

        let reloaded = VectorIndex::initialize(dir.path(), 1_000, 8, 0.0).unwrap();
        prop_assert_eq!(reloaded.len(), vectors.len());
        for (v, expected) in vectors.iter().zip(before.iter()) {
            let after = reloaded.query_top_k(v, 3, None);
            prop_assert_eq!(&after, expected);
        }
    }

    #[test]
    fn upsert_remove_upsert_is_one_upsert(vectors in prop::collection::vec(vector_strategy(), 2..8)) {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();

        // Index A: churn the first fingerprint through remove and re-insert.
        let mut churned = VectorIndex::initialize(dir_a.path(), 1_000, 8, 0.0).unwrap();
        for (i, v) in vectors.iter().enumerate() {
            churned.upsert(&intent(&format!("intent-prop-{i:04}"), i as i64), v).unwrap();
        }
        churned.remove("intent-prop-0000");
        churned.upsert(&intent("intent-prop-0000", 0), &vectors[0]).unwrap();

        // Index B: plain single upserts.
        let mut plain = VectorIndex::initialize(dir_b.path(), 1_000, 8, 0.0).unwrap();
        for (i, v) in vectors.iter().enumerate() {
            plain.upsert(&intent(&format!("intent-prop-{i:04}"), i as i64), v).unwrap();
        }

        prop_assert_eq!(churned.len(), plain.len());
        for v in &vectors {
            let a: Vec<String> = churned.query_top_k(v, 3, None).into_iter().map(|(fp, _)| fp).collect();
            let b: Vec<String> = plain.query_top_k(v, 3, None).into_iter().map(|(fp, _)| fp).collect();
            prop_assert_eq!(a, b);
        }
    }
}
