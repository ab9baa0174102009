//! Embedding encoders.
//!
//! An [`Embedder`] maps text to fixed-dimension vectors. Two implementations
//! are provided:
//!
//! - [`static_model::StaticModelEmbedder`] (feature `embeddings-model2vec`):
//!   static token embeddings fetched from the Hugging Face Hub; no ONNX or
//!   torch runtime required.
//! - [`hashing::HashingEmbedder`]: a deterministic token-hash bag-of-words
//!   encoder with no model download, selected by ids of the form
//!   `hashing-<dim>`. Intended for tests and air-gapped deployments.
//!
//! Encoders are shared process-wide through [`shared`], so every store facade
//! in the process reuses one model instance per model id.

pub mod hashing;
#[cfg(feature = "embeddings-model2vec")]
pub mod static_model;

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::error::Result;
#[cfg(not(feature = "embeddings-model2vec"))]
use crate::error::LoamError;

/// Query-side marker for asymmetric encoders (the ruri model convention).
pub const QUERY_PREFIX: &str = "検索クエリ: ";
/// Document-side marker for asymmetric encoders.
pub const DOCUMENT_PREFIX: &str = "検索文書: ";

/// A deterministic text encoder.
///
/// `embed` returns one vector per input text, each of exactly
/// `dimension()` components. Implementations must be thread-safe; the
/// process-wide registry hands the same instance to every caller.
pub trait Embedder: Send + Sync {
    /// Model identifier this encoder was constructed from.
    fn id(&self) -> &str;

    /// Output dimension, fixed for the encoder's lifetime.
    fn dimension(&self) -> usize;

    /// Encode a batch of texts.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Encode a single text.
    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()])?;
        Ok(vectors.remove(0))
    }
}

lazy_static! {
    static ref SHARED_EMBEDDERS: Mutex<HashMap<String, Arc<dyn Embedder>>> =
        Mutex::new(HashMap::new());
}

/// Return the process-wide encoder for `model_id`, constructing it on first
/// use. Construction happens under the registry lock, so concurrent callers
/// never load the same model twice.
pub fn shared(model_id: &str) -> Result<Arc<dyn Embedder>> {
    let mut registry = SHARED_EMBEDDERS.lock();
    if let Some(embedder) = registry.get(model_id) {
        return Ok(embedder.clone());
    }
    let embedder = construct(model_id)?;
    registry.insert(model_id.to_string(), embedder.clone());
    Ok(embedder)
}

fn construct(model_id: &str) -> Result<Arc<dyn Embedder>> {
    if let Some(embedder) = hashing::HashingEmbedder::from_model_id(model_id)? {
        return Ok(Arc::new(embedder));
    }

    #[cfg(feature = "embeddings-model2vec")]
    {
        Ok(Arc::new(static_model::StaticModelEmbedder::from_pretrained(
            model_id,
        )?))
    }

    #[cfg(not(feature = "embeddings-model2vec"))]
    {
        Err(LoamError::invalid_config(format!(
            "model '{model_id}' requires the 'embeddings-model2vec' feature \
             (or use a 'hashing-<dim>' model id)"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_returns_same_instance() {
        let a = shared("hashing-32").unwrap();
        let b = shared("hashing-32").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.dimension(), 32);
    }

    #[test]
    fn embed_one_matches_batch() {
        let embedder = shared("hashing-64").unwrap();
        let single = embedder.embed_one("alpha beta").unwrap();
        let batch = embedder.embed(&["alpha beta".to_string()]).unwrap();
        assert_eq!(single, batch[0]);
    }
}
