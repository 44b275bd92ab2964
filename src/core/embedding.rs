//! Embedding records and dimension validation.
//!
//! All vectors in one store share a single dimensionality; mixed dimensions
//! are a hard invariant violation and a failing batch is rejected whole.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::error::CoreError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
    pub created_at: u64,
}

impl EmbeddingRecord {
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// Per-store dimension metadata, fixed by the first accepted record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionMeta {
    pub dimension: Option<usize>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("dimension mismatch: record `{id}` has {got}, store expects {expected}")]
    DimensionMismatch {
        id: String,
        expected: usize,
        got: usize,
    },
    #[error("record `{id}` has an empty vector")]
    EmptyVector { id: String },
    #[error("record `{id}` contains a non-finite element at index {index}")]
    NonFiniteElement { id: String, index: usize },
}

impl From<EmbeddingError> for CoreError {
    fn from(err: EmbeddingError) -> Self {
        CoreError::validation(err.to_string())
    }
}

/// Validate a batch against the store's dimension metadata.
///
/// Returns the dimension the store should record. The batch is
/// all-or-nothing: the first violation rejects every record.
pub fn validate_batch(
    records: &[EmbeddingRecord],
    meta: DimensionMeta,
) -> Result<DimensionMeta, EmbeddingError> {
    let mut expected = meta.dimension;

    for record in records {
        if record.vector.is_empty() {
            return Err(EmbeddingError::EmptyVector {
                id: record.id.clone(),
            });
        }
        if let Some(index) = record.vector.iter().position(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFiniteElement {
                id: record.id.clone(),
                index,
            });
        }
        match expected {
            None => expected = Some(record.dimension()),
            Some(dim) if dim != record.dimension() => {
                return Err(EmbeddingError::DimensionMismatch {
                    id: record.id.clone(),
                    expected: dim,
                    got: record.dimension(),
                });
            }
            Some(_) => {}
        }
    }

    Ok(DimensionMeta {
        dimension: expected,
    })
}
