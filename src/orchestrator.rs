//! Sync orchestrator.
//!
//! Drives one codebase from "what the repository looks like now" to "what
//! the vector index holds" through an explicit state machine:
//!
//! | Phase | Progress | Work |
//! |-------|----------|------|
//! | `Fetching` | 5% | List the repository tree at the requested ref, apply path globs |
//! | `Diffing` | 15% | Build the Merkle tree, load the previous record, compute the change set |
//! | `Chunking` | 20–35% | Download `added ∪ modified` blobs, chunk them, drop chunks that are already indexed |
//! | `Embedding` | 35–70% | Embed the remaining chunks |
//! | `Upserting` | 70–95% | Ensure the index, delete stale ids, upsert, persist the record |
//! | `Complete` | 100% | |
//!
//! An empty change set completes as `NoChanges` straight from `Diffing`
//! without touching the embedder or the index.
//!
//! # Failure semantics
//!
//! Listing, diffing, state and index-control errors are fatal and move the
//! run to `Error` without writing the record. Per-file and per-batch
//! failures become warnings; the affected paths are written back with their
//! previous hash (or left out when new) so the next sync retries them. The
//! manifest of such a path lists the ids the index actually holds for it.
//!
//! A missing index, or one whose dimension differs from the embedder's,
//! turns the run into a full reindex: the recorded tree only describes
//! vectors that live in the current index.
//!
//! # Concurrency
//!
//! At most one run per codebase: [`SyncOrchestrator::start`] and
//! [`SyncOrchestrator::run`] take a lease that is released when the run
//! ends, and reject a second request with [`SyncError::AlreadyRunning`].
//! Other writers of the sync record go through
//! [`SyncOrchestrator::exclusive`], which holds the same lease.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use codesync_core::chunk::{ChunkError, Chunker};
use codesync_core::diff::{diff, ChangeSet};
use codesync_core::error::SyncError;
use codesync_core::merkle::{build_tree, normalize_path, FileEntry, MerkleTree};
use codesync_core::models::{CodeChunk, EmbeddingResult, VectorRecord};

use crate::embedder::Embedder;
use crate::jobs::{JobRecorder, JobRegistry, SyncJob};
use crate::progress::{ProgressEvent, ProgressObserver, SyncPhase};
use crate::repo::{PathFilter, RepositoryEntry, RepositorySource, TreeListing};
use crate::sync_state::{RepositorySyncRecord, SyncStateStore, WebhookCredentials};
use crate::vector_index::{EnsureOutcome, VectorIndexClient};

/// What to sync, and from where.
#[derive(Clone)]
pub struct SyncRequest {
    pub codebase_id: String,
    pub source: Arc<dyn RepositorySource>,
    pub paths: PathFilter,
    /// Commit or branch; `None` means the default branch head.
    pub git_ref: Option<String>,
    /// Ignore the previous record: purge the codebase and index everything.
    pub full: bool,
}

impl SyncRequest {
    pub fn for_entry(entry: &RepositoryEntry) -> Self {
        Self {
            codebase_id: entry.id.clone(),
            source: entry.source.clone(),
            paths: entry.paths.clone(),
            git_ref: None,
            full: false,
        }
    }

    pub fn at_ref(mut self, git_ref: Option<String>) -> Self {
        self.git_ref = git_ref;
        self
    }

    pub fn full(mut self, full: bool) -> Self {
        self.full = full;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Success,
    PartialSuccess,
    NoChanges,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Success => "success",
            SyncOutcome::PartialSuccess => "partial_success",
            SyncOutcome::NoChanges => "no_changes",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub changes_detected: usize,
    pub files_reindexed: usize,
    pub files_deleted: usize,
    pub chunks_embedded: usize,
    pub chunks_reused: usize,
    pub vectors_upserted: usize,
    pub vectors_deleted: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct SyncReport {
    pub codebase_id: String,
    pub outcome: SyncOutcome,
    pub commit: Option<String>,
    pub root_hash: String,
    pub counts: SyncCounts,
    pub warnings: Vec<String>,
}

// ============ Leases ============

type LeaseMap = Arc<Mutex<HashSet<String>>>;

#[derive(Clone, Default)]
struct LeaseSet {
    active: LeaseMap,
}

/// Held for the lifetime of one run; releases the codebase on drop.
struct Lease {
    active: LeaseMap,
    codebase_id: String,
}

impl LeaseSet {
    fn try_acquire(&self, codebase_id: &str) -> Option<Lease> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(codebase_id.to_string()) {
            return None;
        }
        Some(Lease {
            active: self.active.clone(),
            codebase_id: codebase_id.to_string(),
        })
    }

    fn is_held(&self, codebase_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(codebase_id)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.codebase_id);
    }
}

// ============ Orchestrator ============

/// Collaborators of a [`SyncOrchestrator`].
pub struct OrchestratorParts {
    pub state: Arc<dyn SyncStateStore>,
    pub index: VectorIndexClient,
    pub embedder: Arc<Embedder>,
    pub chunker: Chunker,
    pub jobs: Arc<dyn JobRegistry>,
    /// Receive every run's events, in addition to the job recorder.
    pub observers: Vec<Arc<dyn ProgressObserver>>,
    /// Blob downloads in flight at once.
    pub fetch_concurrency: usize,
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    state: Arc<dyn SyncStateStore>,
    index: VectorIndexClient,
    embedder: Arc<Embedder>,
    chunker: Chunker,
    jobs: Arc<dyn JobRegistry>,
    observers: Vec<Arc<dyn ProgressObserver>>,
    fetch_concurrency: usize,
    leases: LeaseSet,
}

impl SyncOrchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: parts.state,
                index: parts.index,
                embedder: parts.embedder,
                chunker: parts.chunker,
                jobs: parts.jobs,
                observers: parts.observers,
                fetch_concurrency: parts.fetch_concurrency.max(1),
                leases: LeaseSet::default(),
            }),
        }
    }

    pub fn jobs(&self) -> &Arc<dyn JobRegistry> {
        &self.inner.jobs
    }

    pub fn is_syncing(&self, codebase_id: &str) -> bool {
        self.inner.leases.is_held(codebase_id)
    }

    /// Start a background run and return its job id immediately.
    pub fn start(&self, req: SyncRequest) -> Result<String, SyncError> {
        let lease = self
            .inner
            .leases
            .try_acquire(&req.codebase_id)
            .ok_or_else(|| SyncError::AlreadyRunning(req.codebase_id.clone()))?;

        let job = SyncJob::new(&req.codebase_id);
        let job_id = job.id.clone();
        self.inner.jobs.insert(job)?;

        let recorder: Arc<dyn ProgressObserver> =
            Arc::new(JobRecorder::new(self.inner.jobs.clone(), job_id.clone()));
        let inner = self.inner.clone();
        let job_for_log = job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.execute(req, lease, Some(recorder)).await {
                debug!(job = %job_for_log, error = %e, "background sync ended with error");
            }
        });

        Ok(job_id)
    }

    /// Run a sync to completion on the current task.
    pub async fn run(&self, req: SyncRequest) -> Result<SyncReport, SyncError> {
        let lease = self
            .inner
            .leases
            .try_acquire(&req.codebase_id)
            .ok_or_else(|| SyncError::AlreadyRunning(req.codebase_id.clone()))?;
        self.inner.execute(req, lease, None).await
    }

    /// Run `work` holding the codebase's lease, so it never overlaps a sync
    /// or another exclusive operation on the same codebase.
    pub async fn exclusive<T, E, F>(&self, codebase_id: &str, work: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<SyncError>,
    {
        let _lease = self
            .inner
            .leases
            .try_acquire(codebase_id)
            .ok_or_else(|| SyncError::AlreadyRunning(codebase_id.to_string()))?;
        work.await
    }
}

/// Fans events out to observers and keeps emitted progress monotonic.
struct Emitter {
    codebase_id: String,
    observers: Vec<Arc<dyn ProgressObserver>>,
    progress: AtomicU8,
}

impl Emitter {
    fn emit(&self, event: ProgressEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }

    fn bump(&self, progress: u8) -> u8 {
        let previous = self.progress.fetch_max(progress, Ordering::SeqCst);
        previous.max(progress)
    }

    fn phase(&self, phase: SyncPhase, progress: u8, message: impl Into<String>) {
        let message = message.into();
        info!(codebase = %self.codebase_id, phase = phase.as_str(), "{}", message);
        self.emit(ProgressEvent::Phase {
            codebase_id: self.codebase_id.clone(),
            phase,
            progress: self.bump(progress),
            message,
        });
    }

    /// Per-batch progress, interpolated between `from` and `to`.
    fn batch(&self, phase: SyncPhase, from: u8, to: u8, done: usize, total: usize) {
        let span = (to - from) as usize;
        let pct = from as usize + span * done / total.max(1);
        self.emit(ProgressEvent::Batch {
            codebase_id: self.codebase_id.clone(),
            phase,
            progress: self.bump(pct.min(to as usize) as u8),
            done: done as u64,
            total: total as u64,
        });
    }

    fn warning(&self, warnings: &mut Vec<String>, message: String) {
        warn!(codebase = %self.codebase_id, "{}", message);
        self.emit(ProgressEvent::Warning {
            codebase_id: self.codebase_id.clone(),
            message: message.clone(),
        });
        warnings.push(message);
    }
}

/// Output of `Diffing`.
struct Plan {
    commit: Option<String>,
    new_tree: MerkleTree,
    /// Empty when `fresh`.
    old_tree: MerkleTree,
    /// Empty when `fresh`.
    old_manifest: BTreeMap<String, Vec<String>>,
    changes: ChangeSet,
    fresh: bool,
    /// Listing entries keyed by normalized path.
    entries: HashMap<String, FileEntry>,
}

/// Output of `Chunking`.
struct Chunked {
    /// Successfully read paths → all of their current chunks.
    by_path: BTreeMap<String, Vec<CodeChunk>>,
    /// Chunks not already in the index.
    to_embed: Vec<CodeChunk>,
    reused: usize,
}

enum Step {
    Fetch,
    Diff(TreeListing),
    Chunk(Plan),
    Embed(Plan, Chunked),
    Upsert(Plan, Chunked, Vec<EmbeddingResult>),
    Done(SyncReport),
}

struct Run<'a> {
    inner: &'a Inner,
    req: SyncRequest,
    emitter: Emitter,
    warnings: Vec<String>,
    failed: BTreeSet<String>,
    counts: SyncCounts,
}

impl Inner {
    /// The lease is released before the terminal event goes out, so a
    /// client that sees the job finish can start the next sync at once.
    async fn execute(
        &self,
        req: SyncRequest,
        lease: Lease,
        recorder: Option<Arc<dyn ProgressObserver>>,
    ) -> Result<SyncReport, SyncError> {
        let mut observers = self.observers.clone();
        observers.extend(recorder);
        let codebase_id = req.codebase_id.clone();
        let mut run = Run {
            inner: self,
            req,
            emitter: Emitter {
                codebase_id: codebase_id.clone(),
                observers,
                progress: AtomicU8::new(0),
            },
            warnings: Vec::new(),
            failed: BTreeSet::new(),
            counts: SyncCounts::default(),
        };

        let outcome = run.drive().await;
        drop(lease);
        match outcome {
            Ok(report) => {
                info!(
                    codebase = %codebase_id,
                    outcome = report.outcome.as_str(),
                    reindexed = report.counts.files_reindexed,
                    deleted = report.counts.files_deleted,
                    embedded = report.counts.chunks_embedded,
                    "sync complete"
                );
                run.emitter.emit(ProgressEvent::Finished {
                    codebase_id,
                    report: report.clone(),
                });
                Ok(report)
            }
            Err(e) => {
                error!(codebase = %codebase_id, code = e.code(), error = %e, "sync failed");
                run.emitter.emit(ProgressEvent::Failed {
                    codebase_id,
                    code: e.code().to_string(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

impl Run<'_> {
    async fn drive(&mut self) -> Result<SyncReport, SyncError> {
        let mut step = Step::Fetch;
        loop {
            step = match step {
                Step::Fetch => Step::Diff(self.fetch().await?),
                Step::Diff(listing) => self.diff(listing).await?,
                Step::Chunk(plan) => {
                    let chunked = self.chunk(&plan).await?;
                    Step::Embed(plan, chunked)
                }
                Step::Embed(plan, chunked) => {
                    let results = self.embed(&chunked).await?;
                    Step::Upsert(plan, chunked, results)
                }
                Step::Upsert(plan, chunked, results) => {
                    Step::Done(self.upsert_and_persist(plan, chunked, results).await?)
                }
                Step::Done(report) => return Ok(report),
            };
        }
    }

    async fn fetch(&mut self) -> Result<TreeListing, SyncError> {
        let git_ref = self.req.git_ref.as_deref();
        self.emitter.phase(
            SyncPhase::Fetching,
            5,
            format!("listing {}", git_ref.unwrap_or("default branch")),
        );
        let listing = self
            .req
            .source
            .list_tree(git_ref)
            .await
            .map_err(|e| SyncError::Repository(format!("{:#}", e)))?;
        Ok(self.req.paths.apply(listing))
    }

    async fn diff(&mut self, listing: TreeListing) -> Result<Step, SyncError> {
        self.emitter
            .phase(SyncPhase::Diffing, 15, format!("{} files listed", listing.entries.len()));
        let codebase_id = self.req.codebase_id.clone();

        let new_tree = build_tree(listing.entries.iter().cloned())
            .map_err(|e| SyncError::Repository(e.to_string()))?;
        let previous = self
            .inner
            .state
            .get_sync_record(&codebase_id)
            .await
            .map_err(|e| SyncError::State(format!("{:#}", e)))?;

        let prior_tree = match &previous {
            Some(rec) if rec.is_synced() => match MerkleTree::from_serialized(&rec.tree) {
                Ok(tree) => Some(tree),
                Err(e) => {
                    warn!(codebase = %codebase_id, error = %e, "stored tree is corrupt; reindexing from scratch");
                    None
                }
            },
            _ => None,
        };

        let index_matches = match self.inner.index.describe().await? {
            Some(desc) => desc.dimension == self.inner.embedder.dims(),
            None => false,
        };
        if prior_tree.is_some() && !index_matches {
            warn!(codebase = %codebase_id, "index is missing or has another dimension; reindexing everything");
        }

        let fresh = self.req.full || prior_tree.is_none() || !index_matches;
        let (old_tree, old_manifest) = match (&previous, prior_tree) {
            (Some(rec), Some(tree)) if !fresh => (tree, rec.chunk_manifest.clone()),
            _ => (MerkleTree::empty(), BTreeMap::new()),
        };
        let changes = diff(&old_tree, &new_tree);
        self.counts.changes_detected = changes.total_changes();

        if changes.is_empty() && !self.req.full && index_matches {
            return Ok(Step::Done(
                self.finish_unchanged(previous, new_tree, old_manifest, listing.commit)
                    .await?,
            ));
        }

        debug!(
            codebase = %codebase_id,
            added = changes.added.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            fresh,
            "change set computed"
        );

        let entries = listing
            .entries
            .into_iter()
            .map(|e| (normalize_path(&e.path), e))
            .collect();

        Ok(Step::Chunk(Plan {
            commit: listing.commit,
            new_tree,
            old_tree,
            old_manifest,
            changes,
            fresh,
            entries,
        }))
    }

    /// Nothing changed: complete without embedder or index calls. The
    /// record is only rewritten when the commit moved.
    async fn finish_unchanged(
        &mut self,
        previous: Option<RepositorySyncRecord>,
        tree: MerkleTree,
        manifest: BTreeMap<String, Vec<String>>,
        commit: Option<String>,
    ) -> Result<SyncReport, SyncError> {
        let commit_moved = previous.as_ref().map(|r| &r.last_commit) != Some(&commit);
        if commit_moved {
            let record = RepositorySyncRecord {
                codebase_id: self.req.codebase_id.clone(),
                tree: tree.serialize(),
                last_commit: commit.clone(),
                chunk_manifest: manifest,
                webhook: self.current_webhook().await?,
                synced_at: chrono::Utc::now().to_rfc3339(),
            };
            self.put_record(&record).await?;
        }
        self.emitter.phase(SyncPhase::Complete, 100, "no changes");
        Ok(SyncReport {
            codebase_id: self.req.codebase_id.clone(),
            outcome: SyncOutcome::NoChanges,
            commit,
            root_hash: tree.root_hash().to_string(),
            counts: self.counts.clone(),
            warnings: Vec::new(),
        })
    }

    async fn chunk(&mut self, plan: &Plan) -> Result<Chunked, SyncError> {
        let embedder = &self.inner.embedder;
        embedder.check_dimension(embedder.dims())?;

        let to_fetch: Vec<(String, FileEntry)> = plan
            .changes
            .to_index()
            .filter_map(|path| plan.entries.get(path).map(|e| (path.clone(), e.clone())))
            .collect();
        let total = to_fetch.len();
        self.emitter
            .phase(SyncPhase::Chunking, 20, format!("reading {} files", total));

        let source = self.req.source.clone();
        let fetches: Vec<_> = to_fetch
            .into_iter()
            .map(|(path, entry)| {
                let source = source.clone();
                async move {
                    let bytes = source.get_blob(&entry).await;
                    (path, bytes)
                }
            })
            .collect();
        let mut downloads = stream::iter(fetches).buffer_unordered(self.inner.fetch_concurrency);

        let mut by_path = BTreeMap::new();
        let mut done = 0;
        while let Some((path, bytes)) = downloads.next().await {
            done += 1;
            match bytes {
                Err(e) => {
                    self.emitter
                        .warning(&mut self.warnings, format!("{}: fetch failed: {:#}", path, e));
                    self.failed.insert(path);
                }
                Ok(bytes) => match self.inner.chunker.chunk(&path, &bytes) {
                    Ok(chunks) => {
                        by_path.insert(path, chunks);
                    }
                    Err(ChunkError::Binary) => {
                        debug!(path = %path, "binary file skipped");
                        by_path.insert(path, Vec::new());
                    }
                    Err(e @ ChunkError::TooLarge { .. }) => {
                        self.emitter
                            .warning(&mut self.warnings, format!("{}: skipped: {}", path, e));
                        by_path.insert(path, Vec::new());
                    }
                },
            }
            self.emitter.batch(SyncPhase::Chunking, 20, 35, done, total);
        }

        let mut to_embed = Vec::new();
        let mut reused = 0;
        for (path, chunks) in &by_path {
            let indexed: HashSet<&str> = plan
                .old_manifest
                .get(path)
                .map(|ids| ids.iter().map(String::as_str).collect())
                .unwrap_or_default();
            for chunk in chunks {
                if indexed.contains(chunk.id.as_str()) {
                    reused += 1;
                } else {
                    to_embed.push(chunk.clone());
                }
            }
        }
        self.counts.chunks_reused = reused;

        Ok(Chunked {
            by_path,
            to_embed,
            reused,
        })
    }

    async fn embed(&mut self, chunked: &Chunked) -> Result<Vec<EmbeddingResult>, SyncError> {
        self.emitter.phase(
            SyncPhase::Embedding,
            35,
            format!(
                "embedding {} chunks ({} reused)",
                chunked.to_embed.len(),
                chunked.reused
            ),
        );
        let emitter = &self.emitter;
        let report = self
            .inner
            .embedder
            .embed_chunks(&chunked.to_embed, self.inner.embedder.dims(), |done, total| {
                emitter.batch(SyncPhase::Embedding, 35, 70, done, total)
            })
            .await?;

        let mut failed_paths = BTreeMap::new();
        for failure in report.failures {
            failed_paths.entry(failure.file_path).or_insert(failure.error);
        }
        for (path, error) in failed_paths {
            self.emitter
                .warning(&mut self.warnings, format!("{}: embedding failed: {}", path, error));
            self.failed.insert(path);
        }
        self.counts.chunks_embedded = report.results.len();
        Ok(report.results)
    }

    async fn upsert_and_persist(
        &mut self,
        plan: Plan,
        chunked: Chunked,
        results: Vec<EmbeddingResult>,
    ) -> Result<SyncReport, SyncError> {
        self.emitter.phase(SyncPhase::Upserting, 70, "updating vector index");
        let codebase_id = self.req.codebase_id.clone();
        let index = &self.inner.index;

        let ensured = index.ensure_index(self.inner.embedder.dims()).await?;
        if ensured != EnsureOutcome::Existing && !plan.fresh {
            // The index changed under an incremental run. Whatever the
            // record claims is no longer in the index.
            let webhook = self.current_webhook().await?;
            self.put_record(&RepositorySyncRecord::unsynced(&codebase_id, webhook))
                .await?;
            let what = match ensured {
                EnsureOutcome::Recreated { .. } => "recreated",
                _ => "created",
            };
            return Err(SyncError::Index(format!(
                "index was {} during an incremental sync; the next sync reindexes everything",
                what
            )));
        }
        if plan.fresh {
            self.counts.vectors_deleted += index.delete_by_codebase(&codebase_id).await?;
        }

        // Delete-before-insert: retire ids that no longer exist for each
        // touched path. Failed paths keep their previous vectors.
        let mut stale = Vec::new();
        for path in plan.changes.touched() {
            if self.failed.contains(path) {
                continue;
            }
            let old_ids = match plan.old_manifest.get(path) {
                Some(ids) => ids.clone(),
                None if !plan.fresh && plan.old_tree.file_hash(path).is_some() => {
                    index.ids_for_file(&codebase_id, path).await?
                }
                None => Vec::new(),
            };
            let current: HashSet<&str> = chunked
                .by_path
                .get(path)
                .map(|chunks| chunks.iter().map(|c| c.id.as_str()).collect())
                .unwrap_or_default();
            stale.extend(old_ids.into_iter().filter(|id| !current.contains(id.as_str())));
        }
        self.counts.vectors_deleted += index.delete_ids(&stale).await?;

        let commit = plan.commit.clone();
        let indexed_at = chrono::Utc::now().to_rfc3339();
        let mut embedded: HashMap<String, EmbeddingResult> =
            results.into_iter().map(|r| (r.chunk_id.clone(), r)).collect();
        let mut records = Vec::new();
        let mut owner: HashMap<String, String> = HashMap::new();
        for (path, chunks) in &chunked.by_path {
            if self.failed.contains(path) {
                continue;
            }
            for chunk in chunks {
                if let Some(result) = embedded.remove(&chunk.id) {
                    owner.insert(chunk.id.clone(), path.clone());
                    records.push(VectorRecord::from_chunk(
                        &codebase_id,
                        chunk,
                        result,
                        commit.as_deref(),
                        &indexed_at,
                    ));
                }
            }
        }

        let emitter = &self.emitter;
        let upserted = index
            .upsert_batch(&records, |done, total| {
                emitter.batch(SyncPhase::Upserting, 70, 95, done, total)
            })
            .await;
        self.counts.vectors_upserted = upserted.processed;

        let failed_ids: HashSet<&str> = upserted.failed_ids.iter().map(String::as_str).collect();
        let mut upsert_failed: BTreeSet<String> = BTreeSet::new();
        for id in &upserted.failed_ids {
            if let Some(path) = owner.get(id) {
                upsert_failed.insert(path.clone());
            }
        }
        for path in &upsert_failed {
            self.emitter
                .warning(&mut self.warnings, format!("{}: upsert failed", path));
        }

        // Manifest: touched paths take their new ids. Stale ids of an
        // upsert-failed path are already deleted, so it lists only the ids
        // that are in the index now. Paths that failed earlier were not
        // touched and keep their old ids.
        let mut manifest = plan.old_manifest.clone();
        for path in &plan.changes.deleted {
            manifest.remove(path);
        }
        for (path, chunks) in &chunked.by_path {
            if self.failed.contains(path) {
                continue;
            }
            let ids = chunks
                .iter()
                .map(|c| c.id.clone())
                .filter(|id| !upsert_failed.contains(path) || !failed_ids.contains(id.as_str()))
                .collect();
            manifest.insert(path.clone(), ids);
        }
        self.failed.extend(upsert_failed);

        let overrides: BTreeMap<String, Option<String>> = self
            .failed
            .iter()
            .map(|path| (path.clone(), plan.old_tree.file_hash(path).map(str::to_string)))
            .collect();
        let recorded = plan
            .new_tree
            .with_overrides(&overrides)
            .map_err(|e| SyncError::State(e.to_string()))?;
        manifest.retain(|path, _| recorded.file_hash(path).is_some() || self.failed.contains(path));

        let record = RepositorySyncRecord {
            codebase_id: codebase_id.clone(),
            tree: recorded.serialize(),
            last_commit: commit.clone(),
            chunk_manifest: manifest,
            webhook: self.current_webhook().await?,
            synced_at: chrono::Utc::now().to_rfc3339(),
        };
        self.put_record(&record).await?;

        self.counts.files_reindexed = plan
            .changes
            .to_index()
            .filter(|p| !self.failed.contains(*p))
            .count();
        self.counts.files_deleted = plan.changes.deleted.len();

        let outcome = if self.warnings.is_empty() && self.failed.is_empty() {
            SyncOutcome::Success
        } else {
            SyncOutcome::PartialSuccess
        };
        self.emitter.phase(SyncPhase::Complete, 100, outcome.as_str());

        Ok(SyncReport {
            codebase_id,
            outcome,
            commit,
            root_hash: recorded.root_hash().to_string(),
            counts: self.counts.clone(),
            warnings: std::mem::take(&mut self.warnings),
        })
    }

    /// Webhook credentials as stored now, not as read at `Diffing`.
    async fn current_webhook(&self) -> Result<Option<WebhookCredentials>, SyncError> {
        Ok(self
            .inner
            .state
            .get_sync_record(&self.req.codebase_id)
            .await
            .map_err(|e| SyncError::State(format!("{:#}", e)))?
            .and_then(|r| r.webhook))
    }

    async fn put_record(&self, record: &RepositorySyncRecord) -> Result<(), SyncError> {
        self.inner
            .state
            .put_sync_record(record)
            .await
            .map_err(|e| SyncError::State(format!("{:#}", e)))
    }
}
