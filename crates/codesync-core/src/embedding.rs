//! Embedding provider trait and vector helpers.
//!
//! Concrete providers (OpenAI, Ollama) live in the `codesync` app crate.
//! Retry, batching, truncation, and dimension checks are the embedder
//! service's job; a provider performs exactly one request per call and
//! classifies its failure as [`ProviderError::Transient`] or
//! [`ProviderError::Permanent`].

use async_trait::async_trait;

use crate::error::ProviderError;

/// A text embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier, e.g. `"text-embedding-3-small"`.
    fn model_name(&self) -> &str;
    /// Declared output dimensionality.
    fn dims(&self) -> usize;
    /// Largest number of texts accepted in one request.
    fn max_batch_size(&self) -> usize {
        64
    }
    /// Largest input, in characters, accepted for one text.
    fn max_input_chars(&self) -> usize {
        8000
    }
    /// Embed `texts`, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Keep at most `max_chars` characters from the head of `text`.
///
/// Returns the text and whether anything was cut. Always splits on a char
/// boundary, so the same input always yields the same output.
pub fn truncate_for_embedding(text: &str, max_chars: usize) -> (&str, bool) {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => (&text[..byte_idx], true),
        None => (text, false),
    }
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
