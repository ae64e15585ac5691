//! In-memory [`VectorDatabase`] for tests and local runs.
//!
//! Vectors live in a `BTreeMap` behind `std::sync::RwLock`. Queries are
//! brute-force cosine similarity over every stored vector that passes the
//! filter. Call counters and failure injection let tests observe exactly
//! which data-plane calls a sync made. [`set_delete_lag`] imitates an
//! eventually consistent backend where deleted ids keep showing up in
//! query results for a while.
//!
//! [`set_delete_lag`]: InMemoryVectorDatabase::set_delete_lag

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::filter::Filter;
use crate::models::{VectorMatch, VectorRecord};

use super::{IndexDescription, VectorDatabase};

struct MemIndex {
    dimension: usize,
    /// `describe_index` reports not-ready this many more times.
    pending_polls: usize,
}

/// In-memory vector database.
pub struct InMemoryVectorDatabase {
    name: String,
    index: RwLock<Option<MemIndex>>,
    vectors: RwLock<BTreeMap<String, VectorRecord>>,
    failing_ids: RwLock<HashSet<String>>,
    failing_paths: RwLock<HashSet<String>>,
    /// Deleted records still returned by queries, with the number of
    /// queries they remain visible for.
    ghosts: RwLock<BTreeMap<String, (VectorRecord, usize)>>,
    delete_lag: AtomicUsize,
    not_ready_polls: AtomicUsize,
    upsert_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    query_calls: AtomicUsize,
    create_calls: AtomicUsize,
    drop_calls: AtomicUsize,
}

impl InMemoryVectorDatabase {
    /// An empty database with no index.
    pub fn new() -> Self {
        Self {
            name: "memory".to_string(),
            index: RwLock::new(None),
            vectors: RwLock::new(BTreeMap::new()),
            failing_ids: RwLock::new(HashSet::new()),
            failing_paths: RwLock::new(HashSet::new()),
            ghosts: RwLock::new(BTreeMap::new()),
            delete_lag: AtomicUsize::new(0),
            not_ready_polls: AtomicUsize::new(0),
            upsert_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            drop_calls: AtomicUsize::new(0),
        }
    }

    /// A database whose index already exists with `dimension`.
    pub fn with_index(dimension: usize) -> Self {
        let db = Self::new();
        *db.index.write().unwrap_or_else(PoisonError::into_inner) = Some(MemIndex {
            dimension,
            pending_polls: 0,
        });
        db
    }

    /// Newly created indexes report not-ready for `polls` describe calls.
    pub fn set_not_ready_polls(&self, polls: usize) {
        self.not_ready_polls.store(polls, Ordering::SeqCst);
    }

    /// Deleted records keep appearing in the next `queries` query results.
    pub fn set_delete_lag(&self, queries: usize) {
        self.delete_lag.store(queries, Ordering::SeqCst);
    }

    /// Any upsert batch containing `id` fails.
    pub fn fail_upserts_containing(&self, id: &str) {
        self.failing_ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
    }

    /// Any upsert batch containing a record of `path` fails.
    pub fn fail_upserts_for_file(&self, path: &str) {
        self.failing_paths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.failing_paths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.vectors.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.vectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<VectorRecord> {
        self.vectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Stored records whose metadata `file_path` equals `path`.
    pub fn records_for_file(&self, path: &str) -> Vec<VectorRecord> {
        self.vectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.metadata.file_path == path)
            .cloned()
            .collect()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|i| i.dimension)
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn drop_calls(&self) -> usize {
        self.drop_calls.load(Ordering::SeqCst)
    }

    fn require_dimension(&self) -> Result<usize> {
        match self.dimension() {
            Some(d) => Ok(d),
            None => bail!("index '{}' does not exist", self.name),
        }
    }
}

impl Default for InMemoryVectorDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorDatabase for InMemoryVectorDatabase {
    async fn describe_index(&self) -> Result<Option<IndexDescription>> {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        Ok(index.as_mut().map(|i| {
            let ready = i.pending_polls == 0;
            i.pending_polls = i.pending_polls.saturating_sub(1);
            IndexDescription {
                name: self.name.clone(),
                dimension: i.dimension,
                ready,
            }
        }))
    }

    async fn create_index(&self, dimension: usize) -> Result<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        if index.is_some() {
            bail!("index '{}' already exists", self.name);
        }
        *index = Some(MemIndex {
            dimension,
            pending_polls: self.not_ready_polls.load(Ordering::SeqCst),
        });
        Ok(())
    }

    async fn delete_index(&self) -> Result<()> {
        self.drop_calls.fetch_add(1, Ordering::SeqCst);
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.vectors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.ghosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let dimension = self.require_dimension()?;
        {
            let failing = self.failing_ids.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(r) = records.iter().find(|r| failing.contains(&r.id)) {
                bail!("injected upsert failure for '{}'", r.id);
            }
            let failing = self.failing_paths.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(r) = records.iter().find(|r| failing.contains(&r.metadata.file_path)) {
                bail!("injected upsert failure for '{}'", r.metadata.file_path);
            }
        }
        if let Some(r) = records.iter().find(|r| r.values.len() != dimension) {
            bail!(
                "vector '{}' has dimension {}, index expects {}",
                r.id,
                r.values.len(),
                dimension
            );
        }
        let mut vectors = self.vectors.write().unwrap_or_else(PoisonError::into_inner);
        let mut ghosts = self.ghosts.write().unwrap_or_else(PoisonError::into_inner);
        for r in records {
            ghosts.remove(&r.id);
            vectors.insert(r.id.clone(), r.clone());
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.require_dimension()?;
        let lag = self.delete_lag.load(Ordering::SeqCst);
        let mut vectors = self.vectors.write().unwrap_or_else(PoisonError::into_inner);
        let mut ghosts = self.ghosts.write().unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            if let Some(record) = vectors.remove(id) {
                if lag > 0 {
                    ghosts.insert(id.clone(), (record, lag));
                }
            }
        }
        Ok(())
    }

    async fn query(&self, vector: &[f32], filter: &Filter, top_k: usize) -> Result<Vec<VectorMatch>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        let dimension = self.require_dimension()?;
        if vector.len() != dimension {
            bail!("query vector has dimension {}, index expects {}", vector.len(), dimension);
        }
        let vectors = self.vectors.read().unwrap_or_else(PoisonError::into_inner);
        let mut ghosts = self.ghosts.write().unwrap_or_else(PoisonError::into_inner);
        let visible_ghosts: Vec<VectorRecord> = ghosts.values().map(|(r, _)| r.clone()).collect();
        ghosts.retain(|_, (_, left)| {
            *left = left.saturating_sub(1);
            *left > 0
        });
        let mut matches: Vec<VectorMatch> = vectors
            .values()
            .chain(visible_ghosts.iter())
            .filter(|r| filter.matches(&r.metadata))
            .map(|r| VectorMatch {
                id: r.id.clone(),
                score: cosine_similarity(vector, &r.values),
                metadata: Some(r.metadata.clone()),
            })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        matches.truncate(top_k);
        Ok(matches)
    }
}
