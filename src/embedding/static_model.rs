//! Static-model embedding via model2vec.
//!
//! Loads distilled static token embeddings from a Hugging Face repository
//! (or a local directory). Inference is a token lookup plus mean pooling, so
//! encoding is CPU-cheap and needs no ONNX/torch runtime.

use model2vec_rs::model::StaticModel;

use crate::embedding::Embedder;
use crate::error::{LoamError, Result};

/// Encoder backed by a model2vec `StaticModel`.
pub struct StaticModelEmbedder {
    id: String,
    dimension: usize,
    model: StaticModel,
}

impl StaticModelEmbedder {
    /// Load `model_id` from the Hugging Face Hub (or a local path).
    ///
    /// The output dimension is discovered by encoding a probe sentence once
    /// at construction time.
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        let model = StaticModel::from_pretrained(model_id, None, None, None).map_err(|err| {
            LoamError::embedding(format!("failed to load model '{model_id}': {err}"))
        })?;
        let probe = model.encode(&["dimension probe".to_string()]);
        let dimension = probe
            .first()
            .map(|v| v.len())
            .filter(|&d| d > 0)
            .ok_or_else(|| {
                LoamError::embedding(format!("model '{model_id}' produced an empty embedding"))
            })?;
        Ok(Self {
            id: model_id.to_string(),
            dimension,
            model,
        })
    }
}

impl Embedder for StaticModelEmbedder {
    fn id(&self) -> &str {
        &self.id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = self.model.encode(texts);
        if vectors.len() != texts.len() {
            return Err(LoamError::embedding(format!(
                "encoder returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        for vector in &vectors {
            if vector.len() != self.dimension {
                return Err(LoamError::embedding(format!(
                    "encoder returned a {}-dim vector, expected {}",
                    vector.len(),
                    self.dimension
                )));
            }
        }
        Ok(vectors)
    }
}
