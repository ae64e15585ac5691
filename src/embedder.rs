//! Embedder service: batching, retry, truncation and dimension checks on
//! top of a single-request [`EmbeddingProvider`].
//!
//! | Concern | Behaviour |
//! |---------|-----------|
//! | Batching | `provider.max_batch_size()` chunks per request, up to `concurrency` requests in flight |
//! | Retry | Transient errors retried up to `max_attempts` total, backoff `base * 2^(n-1)` |
//! | Truncation | Text cut to `provider.max_input_chars()` from the head; result marked `truncated` |
//! | Dimensions | Declared dims checked before any request; every returned vector checked after |
//!
//! Exhausted or permanent batch failures do not fail the call: each chunk
//! in the batch lands in [`EmbedReport::failures`]. A dimension mismatch is
//! [`SyncError::FatalConfig`] and aborts immediately.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use codesync_core::embedding::{truncate_for_embedding, EmbeddingProvider};
use codesync_core::error::{ProviderError, SyncError};
use codesync_core::models::{CodeChunk, EmbeddingResult};

use crate::config::EmbeddingConfig;

#[derive(Debug, Clone)]
pub struct EmbedderConfig {
    /// Total attempts per batch, first try included.
    pub max_attempts: u32,
    pub backoff: Duration,
    pub concurrency: usize,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(1000),
            concurrency: 2,
        }
    }
}

impl From<&EmbeddingConfig> for EmbedderConfig {
    fn from(config: &EmbeddingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
            concurrency: config.concurrency.max(1),
        }
    }
}

/// A chunk whose batch could not be embedded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub chunk_id: String,
    pub file_path: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct EmbedReport {
    pub results: Vec<EmbeddingResult>,
    pub failures: Vec<ChunkFailure>,
    /// How many inputs were cut to fit the provider's limit.
    pub truncated: usize,
}

pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    config: EmbedderConfig,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: EmbedderConfig) -> Self {
        Self { provider, config }
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Declared dimensionality of the provider.
    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    /// Fail unless the provider declares `expected` dimensions.
    pub fn check_dimension(&self, expected: usize) -> Result<(), SyncError> {
        let declared = self.provider.dims();
        if declared == 0 {
            return Err(SyncError::FatalConfig(format!(
                "embedding provider '{}' declares no dimensionality",
                self.provider.model_name()
            )));
        }
        if declared != expected {
            return Err(SyncError::FatalConfig(format!(
                "embedding provider '{}' produces {}-dimensional vectors, index expects {}",
                self.provider.model_name(),
                declared,
                expected
            )));
        }
        Ok(())
    }

    /// Embed `chunks`, calling `on_batch(done, total)` after each batch.
    pub async fn embed_chunks<F>(
        &self,
        chunks: &[CodeChunk],
        expected_dim: usize,
        mut on_batch: F,
    ) -> Result<EmbedReport, SyncError>
    where
        F: FnMut(usize, usize),
    {
        let mut report = EmbedReport::default();
        if chunks.is_empty() {
            return Ok(report);
        }
        self.check_dimension(expected_dim)?;

        let max_chars = self.provider.max_input_chars();
        let batch_size = self.provider.max_batch_size().max(1);
        let total = chunks.len().div_ceil(batch_size);

        let requests: Vec<_> = chunks
            .chunks(batch_size)
            .map(|batch| async move {
                let prepared: Vec<(String, bool)> = batch
                    .iter()
                    .map(|c| {
                        let (text, cut) = truncate_for_embedding(&c.content, max_chars);
                        (text.to_string(), cut)
                    })
                    .collect();
                let texts: Vec<String> = prepared.iter().map(|(t, _)| t.clone()).collect();
                let flags: Vec<bool> = prepared.into_iter().map(|(_, cut)| cut).collect();
                let outcome = self.embed_with_retry(&texts).await;
                (batch, flags, outcome)
            })
            .collect();
        let mut batches = stream::iter(requests).buffered(self.config.concurrency);

        let mut done = 0;
        while let Some((batch, flags, outcome)) = batches.next().await {
            done += 1;
            match outcome {
                Ok(vectors) if vectors.len() == batch.len() => {
                    for ((chunk, vector), truncated) in batch.iter().zip(vectors).zip(flags) {
                        if vector.len() != expected_dim {
                            return Err(SyncError::FatalConfig(format!(
                                "provider returned a {}-dimensional vector for chunk {}, expected {}",
                                vector.len(),
                                chunk.id,
                                expected_dim
                            )));
                        }
                        if truncated {
                            report.truncated += 1;
                        }
                        report.results.push(EmbeddingResult {
                            chunk_id: chunk.id.clone(),
                            vector,
                            model: self.provider.model_name().to_string(),
                            truncated,
                        });
                    }
                }
                Ok(vectors) => {
                    let message = format!(
                        "provider returned {} vectors for {} inputs",
                        vectors.len(),
                        batch.len()
                    );
                    warn!(error = %message, "embedding batch rejected");
                    report.failures.extend(failures_for(batch, &message));
                }
                Err(e) => {
                    warn!(error = %e, chunks = batch.len(), "embedding batch failed");
                    report.failures.extend(failures_for(batch, &e.to_string()));
                }
            }
            on_batch(done, total);
        }

        Ok(report)
    }

    async fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut attempt = 1u32;
        loop {
            match self.provider.embed(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(ProviderError::Transient(msg)) if attempt < self.config.max_attempts => {
                    let delay = self.config.backoff * 2u32.pow((attempt - 1).min(5));
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %msg, "retrying embedding batch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn failures_for(batch: &[CodeChunk], error: &str) -> Vec<ChunkFailure> {
    batch
        .iter()
        .map(|c| ChunkFailure {
            chunk_id: c.id.clone(),
            file_path: c.file_path.clone(),
            error: error.to_string(),
        })
        .collect()
}
