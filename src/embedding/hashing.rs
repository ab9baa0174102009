//! Deterministic token-hash embedding.
//!
//! Texts are lowercased, split on non-alphanumeric boundaries, and every
//! token is hashed (crc32) into one of `dimension` buckets; the bucket
//! counts form the vector, which is then L2-normalized. Texts sharing tokens
//! therefore land close under both metrics, which is exactly what the test
//! suite and offline deployments need. No model files are involved.

use crate::embedding::Embedder;
use crate::error::{LoamError, Result};
use crate::vector::l2_normalize;

const MODEL_ID_PREFIX: &str = "hashing-";
const DEFAULT_DIMENSION: usize = 512;

/// Offline bag-of-words encoder over hashed token buckets.
#[derive(Debug)]
pub struct HashingEmbedder {
    id: String,
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            id: format!("{MODEL_ID_PREFIX}{dimension}"),
            dimension,
        }
    }

    /// Parse a `hashing-<dim>` model id. Returns `None` for ids belonging to
    /// other encoder families.
    pub fn from_model_id(model_id: &str) -> Result<Option<Self>> {
        if model_id == "hashing" {
            return Ok(Some(Self::new(DEFAULT_DIMENSION)));
        }
        let Some(suffix) = model_id.strip_prefix(MODEL_ID_PREFIX) else {
            return Ok(None);
        };
        let dimension: usize = suffix.parse().map_err(|_| {
            LoamError::invalid_config(format!(
                "bad hashing model id '{model_id}': expected 'hashing-<dim>'"
            ))
        })?;
        if dimension == 0 {
            return Err(LoamError::invalid_config(
                "hashing embedder dimension must be positive",
            ));
        }
        Ok(Some(Self::new(dimension)))
    }

    fn encode_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();
        for token in lowered.split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            let bucket = crc32fast::hash(token.as_bytes()) as usize % self.dimension;
            vector[bucket] += 1.0;
        }
        l2_normalize(&mut vector);
        vector
    }
}

impl Embedder for HashingEmbedder {
    fn id(&self) -> &str {
        &self.id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.encode_text(t)).collect())
    }
}
