//! Embedding vectors and similarity ranking.

use serde::{Deserialize, Serialize};

/// A fixed-dimension embedding of one message.
///
/// The all-zero vector is reserved for text that could not be embedded and
/// never counts as a similarity match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    /// The embedding values.
    pub values: Vec<f32>,
}

impl EmbeddingVector {
    /// Creates a vector from raw values.
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// The reserved sentinel of the given dimension.
    pub fn zeros(dimension: usize) -> Self {
        Self {
            values: vec![0.0; dimension],
        }
    }

    /// Returns the dimensionality of this vector.
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Whether this is the zero sentinel.
    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|v| *v == 0.0)
    }

    /// Computes cosine similarity with another vector.
    ///
    /// Mismatched dimensions and zero-norm inputs yield 0.0.
    pub fn cosine_similarity(&self, other: &EmbeddingVector) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }

        let dot: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum();

        let norm_a: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = other.values.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        let similarity = dot / (norm_a * norm_b);
        if similarity.is_finite() {
            similarity
        } else {
            0.0
        }
    }

    /// Encodes the values as little-endian f32 bytes for storage.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decodes little-endian f32 bytes. Returns `None` for a ragged buffer.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Some(Self { values })
    }
}

/// Ranks candidates by similarity to `query`.
///
/// Zero sentinels are skipped. Returns at most `limit` entries scoring at
/// least `min_similarity`, best first.
pub fn rank_by_similarity<'a, K>(
    query: &EmbeddingVector,
    candidates: impl IntoIterator<Item = (K, &'a EmbeddingVector)>,
    limit: usize,
    min_similarity: f32,
) -> Vec<(K, f32)> {
    let mut scores: Vec<(K, f32)> = candidates
        .into_iter()
        .filter(|(_, vector)| !vector.is_zero())
        .map(|(key, vector)| (key, query.cosine_similarity(vector)))
        .filter(|(_, score)| *score >= min_similarity)
        .collect();

    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    scores.truncate(limit);
    scores
}
