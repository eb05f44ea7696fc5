/// Exact inner-product index over L2-normalized embeddings
use super::l2_normalize;
use ndarray::{Array2, ArrayView1};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DenseIndexError {
    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Matrix construction failed: {0}")]
    Shape(String),
}

/// Dense vector index
///
/// Rows are chunk indices and are stored unit-norm, so the inner product with
/// a normalized query is the cosine similarity.
#[derive(Debug, Clone)]
pub struct DenseIndex {
    matrix: Array2<f32>,
    dimension: usize,
}

impl DenseIndex {
    /// Build from raw embeddings; each row is normalized here
    pub fn build(embeddings: &[Vec<f32>], dimension: usize) -> Result<Self, DenseIndexError> {
        let mut flat = Vec::with_capacity(embeddings.len() * dimension);
        for embedding in embeddings {
            if embedding.len() != dimension {
                return Err(DenseIndexError::InvalidDimension {
                    expected: dimension,
                    actual: embedding.len(),
                });
            }
            flat.extend(l2_normalize(embedding));
        }

        let matrix = Array2::from_shape_vec((embeddings.len(), dimension), flat)
            .map_err(|e| DenseIndexError::Shape(e.to_string()))?;

        Ok(Self { matrix, dimension })
    }

    /// Rebuild from rows that were already normalized (snapshot restore)
    pub fn from_normalized(rows: Vec<Vec<f32>>, dimension: usize) -> Result<Self, DenseIndexError> {
        let count = rows.len();
        let mut flat = Vec::with_capacity(count * dimension);
        for row in rows {
            if row.len() != dimension {
                return Err(DenseIndexError::InvalidDimension {
                    expected: dimension,
                    actual: row.len(),
                });
            }
            flat.extend(row);
        }

        let matrix = Array2::from_shape_vec((count, dimension), flat)
            .map_err(|e| DenseIndexError::Shape(e.to_string()))?;

        Ok(Self { matrix, dimension })
    }

    /// Empty index (cold start)
    pub fn empty(dimension: usize) -> Self {
        Self {
            matrix: Array2::zeros((0, dimension)),
            dimension,
        }
    }

    pub fn len(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Stored unit vector for a chunk
    pub fn vector(&self, chunk_index: usize) -> Option<ArrayView1<'_, f32>> {
        (chunk_index < self.len()).then(|| self.matrix.row(chunk_index))
    }

    /// Stored vectors as plain rows, for snapshots
    pub fn rows(&self) -> Vec<Vec<f32>> {
        self.matrix.outer_iter().map(|row| row.to_vec()).collect()
    }

    /// Cosine similarity between an already-normalized query and one chunk
    pub fn similarity(&self, normalized_query: &[f32], chunk_index: usize) -> Option<f32> {
        self.vector(chunk_index)
            .map(|row| row.dot(&ArrayView1::from(normalized_query)))
    }

    /// Top-`k` chunk indices by inner product, ties broken by lower index
    ///
    /// `k` larger than the corpus returns every chunk.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>, DenseIndexError> {
        if query.len() != self.dimension {
            return Err(DenseIndexError::InvalidDimension {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let normalized = l2_normalize(query);
        let scores = self.matrix.dot(&ArrayView1::from(normalized.as_slice()));

        let mut scored: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }
}
