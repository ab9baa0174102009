//! Flat vector index with exact (brute force) nearest neighbor search.
//!
//! The index is a flat collection of `(document id, vector)` pairs persisted
//! as a single file (see [`codec`]). There is no ANN structure: every search
//! scans all vectors, which is the intended trade-off for knowledge bases in
//! the thousands-of-entries range.

pub mod codec;

use std::cmp::Ordering;

use crate::error::{LoamError, Result};

/// Distance metric, fixed for the lifetime of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Squared Euclidean distance. Lower scores are closer.
    L2,
    /// Inner product over L2-normalized vectors. Higher scores are closer.
    Cosine,
}

impl Metric {
    pub fn parse(s: &str) -> Result<Metric> {
        match s.to_ascii_lowercase().as_str() {
            "l2" => Ok(Metric::L2),
            "cosine" => Ok(Metric::Cosine),
            other => Err(LoamError::invalid_config(format!(
                "unknown distance metric '{other}' (expected 'l2' or 'cosine')"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::L2 => "l2",
            Metric::Cosine => "cosine",
        }
    }

    /// Whether `score` passes the relevance cutoff for this metric.
    ///
    /// L2 scores are distances (keep below the threshold); inner-product
    /// scores are similarities (keep above it).
    pub fn within_threshold(&self, score: f32, threshold: f32) -> bool {
        match self {
            Metric::L2 => score < threshold,
            Metric::Cosine => score > threshold,
        }
    }

    fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::L2 => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| {
                    let d = x - y;
                    d * d
                })
                .sum(),
            Metric::Cosine => a.iter().zip(b.iter()).map(|(x, y)| x * y).sum(),
        }
    }
}

/// A single search result: document id and metric-dependent score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub id: i64,
    pub score: f32,
}

/// In-memory flat vector collection keyed by document id.
///
/// Ids are unique; uniqueness is guaranteed by the facade (documents are
/// keyed by their database rowid). Vectors are stored flattened row-major
/// next to a parallel id list.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    metric: Metric,
    dimension: usize,
    ids: Vec<i64>,
    data: Vec<f32>,
}

impl VectorIndex {
    pub fn new(metric: Metric, dimension: usize) -> Self {
        Self {
            metric,
            dimension,
            ids: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    fn vector_at(&self, pos: usize) -> &[f32] {
        let start = pos * self.dimension;
        &self.data[start..start + self.dimension]
    }

    /// Append a vector under `id`. The dimension must match the index.
    pub fn add(&mut self, id: i64, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(LoamError::invalid_argument(format!(
                "vector dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            )));
        }
        self.ids.push(id);
        self.data.extend_from_slice(vector);
        Ok(())
    }

    /// Remove the vector stored under `id`. Returns `false` when absent.
    pub fn remove(&mut self, id: i64) -> bool {
        match self.ids.iter().position(|&x| x == id) {
            Some(pos) => {
                self.ids.remove(pos);
                let start = pos * self.dimension;
                self.data.drain(start..start + self.dimension);
                true
            }
            None => false,
        }
    }

    /// Return up to `k` hits ordered best-first for the index metric
    /// (ascending distance for L2, descending similarity for inner product).
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(LoamError::invalid_argument(format!(
                "query dimension mismatch: expected {}, got {}",
                self.dimension,
                query.len()
            )));
        }
        if k == 0 || self.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<SearchHit> = self
            .ids
            .iter()
            .enumerate()
            .map(|(pos, &id)| SearchHit {
                id,
                score: self.metric.score(query, self.vector_at(pos)),
            })
            .collect();

        match self.metric {
            Metric::L2 => {
                hits.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal))
            }
            Metric::Cosine => {
                hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
            }
        }
        hits.truncate(k);
        Ok(hits)
    }
}

/// Normalize `vector` to unit L2 length in place. Zero vectors are left as-is.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index(metric: Metric) -> VectorIndex {
        let mut index = VectorIndex::new(metric, 3);
        index.add(1, &[1.0, 0.0, 0.0]).unwrap();
        index.add(2, &[0.0, 1.0, 0.0]).unwrap();
        index.add(3, &[0.0, 0.0, 1.0]).unwrap();
        index
    }

    #[test]
    fn l2_search_orders_ascending() {
        let index = sample_index(Metric::L2);
        let hits = index.search(&[1.0, 0.1, 0.0], 3).unwrap();
        assert_eq!(hits[0].id, 1);
        assert!(hits[0].score <= hits[1].score);
        assert!(hits[1].score <= hits[2].score);
    }

    #[test]
    fn cosine_search_orders_descending() {
        let index = sample_index(Metric::Cosine);
        let hits = index.search(&[0.0, 1.0, 0.0], 3).unwrap();
        assert_eq!(hits[0].id, 2);
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn l2_scores_are_squared_distances() {
        let index = sample_index(Metric::L2);
        let hits = index.search(&[1.0, 0.0, 0.0], 3).unwrap();
        // Distance from [1,0,0] to [0,1,0] is sqrt(2); the score is 2.
        let to_second = hits.iter().find(|h| h.id == 2).unwrap();
        assert!((to_second.score - 2.0).abs() < 1e-6);
    }

    #[test]
    fn remove_is_noop_when_absent() {
        let mut index = sample_index(Metric::L2);
        assert!(!index.remove(42));
        assert_eq!(index.len(), 3);
        assert!(index.remove(2));
        assert_eq!(index.len(), 2);
        assert!(!index.contains(2));
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut index = VectorIndex::new(Metric::L2, 3);
        assert!(index.add(1, &[1.0, 2.0]).is_err());
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn search_empty_returns_empty() {
        let index = VectorIndex::new(Metric::L2, 3);
        assert!(index.search(&[0.0, 0.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn normalize_produces_unit_length() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }
}
