//! Cosine-similarity search over a shared vector block.
//!
//! Layering: [`VectorBlock`] is infrastructure (contiguous storage, row
//! views); query validation is business logic; [`run_search`] is the pure
//! compute kernel the worker executes. The pool orchestrates all three
//! without either layer depending on the other.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::embedding::EmbeddingRecord;
use crate::core::error::CoreError;

/// Contiguous `count x dimensions` block of f32s, shared across workers
/// without copying. Rows are lent as immutable views; writers coordinate
/// through the scheduler so no mutation overlaps an active search.
#[derive(Clone, Debug)]
pub struct VectorBlock {
    data: Arc<[f32]>,
    dimensions: usize,
    count: usize,
}

impl VectorBlock {
    /// Pack records into one block. Records must already be
    /// dimension-validated; mixed dimensions here are a programmer error.
    pub fn from_records(records: &[EmbeddingRecord]) -> Result<Self, CoreError> {
        let dimensions = match records.first() {
            Some(first) => first.vector.len(),
            None => {
                return Ok(Self {
                    data: Arc::from(Vec::new()),
                    dimensions: 0,
                    count: 0,
                })
            }
        };
        let mut data = Vec::with_capacity(records.len() * dimensions);
        for record in records {
            if record.vector.len() != dimensions {
                return Err(CoreError::validation(format!(
                    "dimension mismatch packing block: `{}` has {}, block has {dimensions}",
                    record.id,
                    record.vector.len(),
                )));
            }
            data.extend_from_slice(&record.vector);
        }
        Ok(Self {
            data: Arc::from(data),
            dimensions,
            count: records.len(),
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Zero-copy view of one row.
    pub fn row(&self, index: usize) -> &[f32] {
        let start = index * self.dimensions;
        &self.data[start..start + self.dimensions]
    }
}

/// `dot(a,b) / (|a|*|b|)`, with zero magnitude mapped to 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub payload: serde_json::Value,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchStats {
    pub scanned: usize,
    pub matched: usize,
    pub shared_memory: bool,
}

/// Business-side validation of a query against the block.
pub fn validate_query(query: &[f32], dimensions: usize) -> Result<(), CoreError> {
    if query.is_empty() {
        return Err(CoreError::validation("query vector is empty"));
    }
    if let Some(index) = query.iter().position(|v| !v.is_finite()) {
        return Err(CoreError::validation(format!(
            "query vector has a non-finite element at index {index}"
        )));
    }
    if dimensions != 0 && query.len() != dimensions {
        return Err(CoreError::validation(format!(
            "dimension mismatch: query has {}, block has {dimensions}",
            query.len()
        )));
    }
    Ok(())
}

/// Score every row, keep those at or above `threshold`, sort descending
/// with ties in insertion order, truncate to `limit`.
///
/// Deterministic for fixed inputs: same scores, same order, every run.
pub fn run_search(
    block: &VectorBlock,
    ids_payloads: &[(String, serde_json::Value)],
    query: &[f32],
    threshold: f32,
    limit: usize,
) -> (Vec<SearchHit>, SearchStats) {
    let mut hits = Vec::new();
    for index in 0..block.count() {
        let score = cosine_similarity(query, block.row(index));
        if score >= threshold {
            let (id, payload) = &ids_payloads[index];
            hits.push(SearchHit {
                id: id.clone(),
                score,
                payload: payload.clone(),
            });
        }
    }
    let matched = hits.len();
    // Stable sort keeps equal scores in insertion order.
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(limit);
    (
        hits,
        SearchStats {
            scanned: block.count(),
            matched,
            shared_memory: true,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            id: id.to_string(),
            vector,
            payload: serde_json::Value::Null,
            created_at: 0,
        }
    }

    fn block_of(records: &[EmbeddingRecord]) -> (VectorBlock, Vec<(String, serde_json::Value)>) {
        let block = VectorBlock::from_records(records).unwrap();
        let meta = records
            .iter()
            .map(|r| (r.id.clone(), r.payload.clone()))
            .collect();
        (block, meta)
    }

    #[test]
    fn cosine_basics() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn search_ranks_and_truncates() {
        let records = vec![
            record("a", vec![1.0, 0.0, 0.0]),
            record("b", vec![0.0, 1.0, 0.0]),
            record("c", vec![0.9, 0.1, 0.0]),
        ];
        let (block, meta) = block_of(&records);

        let (hits, stats) = run_search(&block, &meta, &[1.0, 0.0, 0.0], 0.5, 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert_eq!(hits[1].id, "c");
        assert!((hits[1].score - 0.9939).abs() < 1e-3);
        assert_eq!(stats.scanned, 3);
        assert_eq!(stats.matched, 2);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let records = vec![
            record("first", vec![1.0, 0.0]),
            record("second", vec![2.0, 0.0]),
            record("third", vec![3.0, 0.0]),
        ];
        let (block, meta) = block_of(&records);

        let (hits, _) = run_search(&block, &meta, &[1.0, 0.0], 0.0, 10);
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn search_is_deterministic() {
        let records: Vec<_> = (0..50)
            .map(|i| {
                record(
                    &format!("r{i}"),
                    vec![(i as f32).sin(), (i as f32).cos(), 0.5],
                )
            })
            .collect();
        let (block, meta) = block_of(&records);
        let query = vec![0.3, -0.7, 0.64];

        let (first, _) = run_search(&block, &meta, &query, 0.1, 20);
        for _ in 0..5 {
            let (again, _) = run_search(&block, &meta, &query, 0.1, 20);
            assert_eq!(first, again);
        }
    }

    #[test]
    fn zero_magnitude_rows_score_zero() {
        let records = vec![record("zero", vec![0.0, 0.0]), record("one", vec![1.0, 0.0])];
        let (block, meta) = block_of(&records);

        let (hits, _) = run_search(&block, &meta, &[1.0, 0.0], 0.0, 10);
        let zero_hit = hits.iter().find(|h| h.id == "zero").unwrap();
        assert_eq!(zero_hit.score, 0.0);
    }

    #[test]
    fn block_rows_are_views() {
        let records = vec![record("a", vec![1.0, 2.0]), record("b", vec![3.0, 4.0])];
        let block = VectorBlock::from_records(&records).unwrap();
        assert_eq!(block.count(), 2);
        assert_eq!(block.dimensions(), 2);
        assert_eq!(block.row(0), &[1.0, 2.0]);
        assert_eq!(block.row(1), &[3.0, 4.0]);
    }

    #[test]
    fn query_validation() {
        assert!(validate_query(&[1.0, 0.0], 2).is_ok());
        assert!(validate_query(&[], 2).is_err());
        assert!(validate_query(&[1.0], 2).is_err());
        assert!(validate_query(&[f32::NAN, 0.0], 2).is_err());
    }

    #[test]
    fn payloads_travel_with_hits() {
        let mut rec = record("a", vec![1.0, 0.0]);
        rec.payload = json!({"chunk": "c-9"});
        let (block, meta) = block_of(&[rec]);
        let (hits, _) = run_search(&block, &meta, &[1.0, 0.0], 0.5, 1);
        assert_eq!(hits[0].payload, json!({"chunk": "c-9"}));
    }
}
