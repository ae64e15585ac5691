//! Vector index client.
//!
//! Wraps a [`VectorDatabase`] with the lifecycle and bulk operations the
//! sync engine needs:
//!
//! | Operation | Behaviour |
//! |-----------|-----------|
//! | [`ensure_index`](VectorIndexClient::ensure_index) | Create if missing; drop and recreate on dimension change; poll until ready |
//! | [`upsert_batch`](VectorIndexClient::upsert_batch) | Fixed-size batches with a delay between them; failed batches counted, not raised |
//! | [`describe`](VectorIndexClient::describe) | Current dimension and readiness, no side effects |
//! | [`delete_by_codebase`](VectorIndexClient::delete_by_codebase) | Resolve ids with filtered dummy-vector queries, then delete by id; back off while deleted ids linger |
//! | [`get_by_codebase`](VectorIndexClient::get_by_codebase) | Any vectors for this codebase? |
//! | [`delete_ids`](VectorIndexClient::delete_ids) | Explicit id deletion in batches |
//! | [`ids_for_file`](VectorIndexClient::ids_for_file) | Ids indexed for one path |
//!
//! Id resolution queries use the unit vector `e0` as the query vector; the
//! filter decides the result set and the scores are ignored.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tracing::{debug, info, warn};

use codesync_core::error::SyncError;
use codesync_core::filter::Filter;
use codesync_core::models::{VectorMatch, VectorRecord};
use codesync_core::store::memory::InMemoryVectorDatabase;
use codesync_core::store::{IndexDescription, VectorDatabase};

use crate::config::IndexConfig;
use crate::pinecone::PineconeDatabase;

/// Explicit deletes are sent at most this many ids at a time.
const DELETE_BATCH: usize = 1000;

/// Consecutive queries that may return only already-deleted ids before
/// `delete_by_codebase` gives up. Query results lag deletes on
/// eventually consistent backends.
const MAX_STALE_QUERIES: u32 = 5;

#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub upsert_batch_size: usize,
    pub upsert_delay: Duration,
    pub ready_timeout: Duration,
    pub ready_poll: Duration,
    pub query_top_k: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            upsert_batch_size: 100,
            upsert_delay: Duration::from_millis(100),
            ready_timeout: Duration::from_secs(60),
            ready_poll: Duration::from_millis(1000),
            query_top_k: 1000,
        }
    }
}

impl From<&IndexConfig> for IndexSettings {
    fn from(config: &IndexConfig) -> Self {
        Self {
            upsert_batch_size: config.upsert_batch_size.max(1),
            upsert_delay: Duration::from_millis(config.upsert_delay_ms),
            ready_timeout: Duration::from_secs(config.ready_timeout_secs),
            ready_poll: Duration::from_millis(config.ready_poll_ms),
            query_top_k: config.query_top_k.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Existing,
    Created,
    /// The index had another dimension and was dropped, losing every vector.
    Recreated { previous_dimension: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub processed: usize,
    /// Failed batches.
    pub errors: usize,
    pub failed_ids: Vec<String>,
}

#[derive(Clone)]
pub struct VectorIndexClient {
    db: Arc<dyn VectorDatabase>,
    settings: IndexSettings,
}

fn index_err(e: anyhow::Error) -> SyncError {
    SyncError::Index(format!("{:#}", e))
}

impl VectorIndexClient {
    pub fn new(db: Arc<dyn VectorDatabase>, settings: IndexSettings) -> Self {
        Self { db, settings }
    }

    pub fn database(&self) -> &Arc<dyn VectorDatabase> {
        &self.db
    }

    /// Current index state, `None` when there is no index.
    pub async fn describe(&self) -> Result<Option<IndexDescription>, SyncError> {
        self.db.describe_index().await.map_err(index_err)
    }

    /// Make sure a ready index of `dimension` exists.
    pub async fn ensure_index(&self, dimension: usize) -> Result<EnsureOutcome, SyncError> {
        let outcome = match self.db.describe_index().await.map_err(index_err)? {
            Some(desc) if desc.dimension == dimension => EnsureOutcome::Existing,
            Some(desc) => {
                warn!(
                    index = %desc.name,
                    old = desc.dimension,
                    new = dimension,
                    "index dimension changed; dropping and recreating"
                );
                self.db.delete_index().await.map_err(index_err)?;
                self.db.create_index(dimension).await.map_err(index_err)?;
                EnsureOutcome::Recreated {
                    previous_dimension: desc.dimension,
                }
            }
            None => {
                info!(dimension, "creating vector index");
                self.db.create_index(dimension).await.map_err(index_err)?;
                EnsureOutcome::Created
            }
        };

        self.wait_ready().await?;
        Ok(outcome)
    }

    async fn wait_ready(&self) -> Result<(), SyncError> {
        let deadline = Instant::now() + self.settings.ready_timeout;
        loop {
            match self.db.describe_index().await.map_err(index_err)? {
                Some(desc) if desc.ready => return Ok(()),
                _ if Instant::now() >= deadline => {
                    return Err(SyncError::FatalConfig(format!(
                        "vector index not ready after {:?}",
                        self.settings.ready_timeout
                    )));
                }
                _ => {
                    debug!("index not ready yet");
                    tokio::time::sleep(self.settings.ready_poll).await;
                }
            }
        }
    }

    /// Upsert `records` in fixed-size batches, calling `on_batch(done, total)`
    /// after each. A failed batch is recorded and the rest continue.
    pub async fn upsert_batch<F>(&self, records: &[VectorRecord], mut on_batch: F) -> UpsertReport
    where
        F: FnMut(usize, usize),
    {
        let mut report = UpsertReport::default();
        let size = self.settings.upsert_batch_size.max(1);
        let total = records.len().div_ceil(size);

        for (i, batch) in records.chunks(size).enumerate() {
            if i > 0 && !self.settings.upsert_delay.is_zero() {
                tokio::time::sleep(self.settings.upsert_delay).await;
            }
            match self.db.upsert(batch).await {
                Ok(()) => report.processed += batch.len(),
                Err(e) => {
                    warn!(batch = i + 1, size = batch.len(), error = %e, "upsert batch failed");
                    report.errors += 1;
                    report.failed_ids.extend(batch.iter().map(|r| r.id.clone()));
                }
            }
            on_batch(i + 1, total);
        }
        report
    }

    /// Delete by explicit id. Returns the number of ids sent.
    pub async fn delete_ids(&self, ids: &[String]) -> Result<usize, SyncError> {
        for batch in ids.chunks(DELETE_BATCH) {
            self.db.delete(batch).await.map_err(index_err)?;
        }
        Ok(ids.len())
    }

    /// Remove every vector belonging to `codebase_id`. A codebase with no
    /// vectors, or a missing index, is a no-op.
    pub async fn delete_by_codebase(&self, codebase_id: &str) -> Result<usize, SyncError> {
        let filter = Filter::codebase(codebase_id);
        let mut gone: HashSet<String> = HashSet::new();
        let mut stale_queries = 0;
        loop {
            let ids: Vec<String> = self
                .query(&filter, self.settings.query_top_k)
                .await?
                .into_iter()
                .map(|m| m.id)
                .filter(|id| !gone.contains(id))
                .collect();
            if !ids.is_empty() {
                stale_queries = 0;
                self.delete_ids(&ids).await?;
                gone.extend(ids);
                continue;
            }
            // Either nothing is left, or the query only returned ids we
            // already deleted. Only the first is certain.
            if self.query(&filter, 1).await?.is_empty() {
                break;
            }
            stale_queries += 1;
            if stale_queries > MAX_STALE_QUERIES {
                return Err(SyncError::Index(format!(
                    "deleting vectors for '{}' made no progress after {} queries",
                    codebase_id, MAX_STALE_QUERIES
                )));
            }
            debug!(codebase = codebase_id, attempt = stale_queries, "deleted ids still visible; waiting");
            tokio::time::sleep(self.settings.ready_poll * stale_queries).await;
        }
        let deleted = gone.len();
        if deleted > 0 {
            info!(codebase = codebase_id, deleted, "purged codebase vectors");
        }
        Ok(deleted)
    }

    pub async fn get_by_codebase(
        &self,
        codebase_id: &str,
        top_k: usize,
    ) -> Result<Vec<VectorMatch>, SyncError> {
        self.query(&Filter::codebase(codebase_id), top_k).await
    }

    pub async fn ids_for_file(&self, codebase_id: &str, path: &str) -> Result<Vec<String>, SyncError> {
        Ok(self
            .query(&Filter::file(codebase_id, path), self.settings.query_top_k)
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect())
    }

    async fn query(&self, filter: &Filter, top_k: usize) -> Result<Vec<VectorMatch>, SyncError> {
        filter.validate()?;
        let Some(desc) = self.db.describe_index().await.map_err(index_err)? else {
            return Ok(Vec::new());
        };
        let mut probe = vec![0.0f32; desc.dimension.max(1)];
        probe[0] = 1.0;
        self.db.query(&probe, filter, top_k).await.map_err(index_err)
    }
}

/// Instantiate the database named by `config.provider`.
pub fn create_database(config: &IndexConfig) -> Result<Arc<dyn VectorDatabase>> {
    match config.provider.as_str() {
        "memory" => Ok(Arc::new(InMemoryVectorDatabase::new())),
        "pinecone" => Ok(Arc::new(PineconeDatabase::from_config(config)?)),
        other => bail!("Unknown index provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codesync_core::models::VectorMetadata;

    fn settings() -> IndexSettings {
        IndexSettings {
            upsert_batch_size: 2,
            upsert_delay: Duration::ZERO,
            ready_timeout: Duration::from_millis(50),
            ready_poll: Duration::from_millis(1),
            query_top_k: 3,
        }
    }

    fn record(id: &str, codebase: &str, path: &str) -> VectorRecord {
        VectorRecord {
            id: id.into(),
            values: vec![0.0, 1.0],
            metadata: VectorMetadata {
                codebase_id: codebase.into(),
                file_path: path.into(),
                obfuscated_path: String::new(),
                start_line: 1,
                end_line: 2,
                language: "rust".into(),
                chunk_kind: "function".into(),
                name: id.into(),
                commit: None,
                indexed_at: String::new(),
                content_preview: String::new(),
                truncated: false,
            },
        }
    }

    #[tokio::test]
    async fn ensure_index_creates_keeps_and_recreates() {
        let db = Arc::new(InMemoryVectorDatabase::new());
        let client = VectorIndexClient::new(db.clone(), settings());

        assert_eq!(client.ensure_index(2).await.unwrap(), EnsureOutcome::Created);
        assert_eq!(client.ensure_index(2).await.unwrap(), EnsureOutcome::Existing);
        assert_eq!(db.create_calls(), 1);

        assert_eq!(
            client.ensure_index(3).await.unwrap(),
            EnsureOutcome::Recreated { previous_dimension: 2 }
        );
        assert_eq!(db.dimension(), Some(3));
        assert_eq!(db.drop_calls(), 1);
    }

    #[tokio::test]
    async fn readiness_timeout_is_fatal() {
        let db = Arc::new(InMemoryVectorDatabase::new());
        db.set_not_ready_polls(usize::MAX);
        let client = VectorIndexClient::new(db, settings());
        let err = client.ensure_index(2).await.unwrap_err();
        assert!(matches!(err, SyncError::FatalConfig(_)));
    }

    #[tokio::test]
    async fn waits_for_readiness() {
        let db = Arc::new(InMemoryVectorDatabase::new());
        db.set_not_ready_polls(3);
        let client = VectorIndexClient::new(db, settings());
        assert_eq!(client.ensure_index(2).await.unwrap(), EnsureOutcome::Created);
    }

    #[tokio::test]
    async fn upsert_batches_count_failures() {
        let db = Arc::new(InMemoryVectorDatabase::with_index(2));
        db.fail_upserts_containing("c");
        let client = VectorIndexClient::new(db.clone(), settings());
        let records: Vec<VectorRecord> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|id| record(id, "cb", "x.rs"))
            .collect();

        let mut seen = Vec::new();
        let report = client
            .upsert_batch(&records, |done, total| seen.push((done, total)))
            .await;

        assert_eq!(report.processed, 3);
        assert_eq!(report.errors, 1);
        assert_eq!(report.failed_ids, vec!["c".to_string(), "d".to_string()]);
        assert_eq!(seen, vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(db.upsert_calls(), 3);
    }

    #[tokio::test]
    async fn delete_by_codebase_pages_until_empty() {
        let db = Arc::new(InMemoryVectorDatabase::with_index(2));
        let mut records: Vec<VectorRecord> =
            (0..7).map(|i| record(&format!("v{}", i), "cb", "x.rs")).collect();
        records.push(record("keep", "other", "x.rs"));
        db.upsert(&records).await.unwrap();

        let client = VectorIndexClient::new(db.clone(), settings());
        assert_eq!(client.delete_by_codebase("cb").await.unwrap(), 7);
        assert_eq!(db.ids(), vec!["keep".to_string()]);

        let deletes = db.delete_calls();
        assert_eq!(client.delete_by_codebase("cb").await.unwrap(), 0);
        assert_eq!(db.delete_calls(), deletes, "empty codebase issues no delete");
    }

    #[tokio::test]
    async fn delete_by_codebase_outlasts_lagging_queries() {
        let db = Arc::new(InMemoryVectorDatabase::with_index(2));
        db.set_delete_lag(2);
        let records: Vec<VectorRecord> =
            (0..7).map(|i| record(&format!("v{}", i), "cb", "x.rs")).collect();
        db.upsert(&records).await.unwrap();

        let client = VectorIndexClient::new(db.clone(), settings());
        assert_eq!(client.delete_by_codebase("cb").await.unwrap(), 7);
        assert!(db.is_empty());
    }

    #[tokio::test]
    async fn delete_by_codebase_gives_up_when_deletes_never_land() {
        let db = Arc::new(InMemoryVectorDatabase::with_index(2));
        db.set_delete_lag(usize::MAX);
        db.upsert(&[record("a", "cb", "x.rs")]).await.unwrap();

        let client = VectorIndexClient::new(db, settings());
        let err = client.delete_by_codebase("cb").await.unwrap_err();
        assert!(matches!(err, SyncError::Index(_)));
    }

    #[tokio::test]
    async fn missing_index_reads_as_empty() {
        let client = VectorIndexClient::new(Arc::new(InMemoryVectorDatabase::new()), settings());
        assert!(client.get_by_codebase("cb", 1).await.unwrap().is_empty());
        assert_eq!(client.delete_by_codebase("cb").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ids_for_file_scopes_by_path() {
        let db = Arc::new(InMemoryVectorDatabase::with_index(2));
        db.upsert(&[record("a", "cb", "x.rs"), record("b", "cb", "y.rs")])
            .await
            .unwrap();
        let client = VectorIndexClient::new(db, settings());
        assert_eq!(client.ids_for_file("cb", "y.rs").await.unwrap(), vec!["b".to_string()]);
        assert!(matches!(
            client.get_by_codebase("", 1).await.unwrap_err(),
            SyncError::Validation(_)
        ));
    }
}
