//! Job registry: pollable status of background syncs.
//!
//! Every sync started through [`crate::orchestrator::SyncOrchestrator::start`]
//! gets a [`SyncJob`]. A [`JobRecorder`] observer folds progress events into
//! it; clients poll `GET /jobs/{id}`. Terminal jobs are evicted once they
//! are older than the retention window, by [`spawn_janitor`].

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::orchestrator::SyncReport;
use crate::progress::{ProgressEvent, ProgressObserver, SyncPhase};

#[derive(Clone, Debug, Serialize)]
pub struct SyncJob {
    pub id: String,
    pub codebase_id: String,
    pub phase: SyncPhase,
    pub progress: u8,
    pub message: String,
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<SyncReport>,
}

/// The polling contract: `{phase, progress, message, errors, result?}`.
#[derive(Clone, Debug, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub codebase_id: String,
    pub phase: SyncPhase,
    pub progress: u8,
    pub message: String,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<SyncReport>,
}

impl SyncJob {
    pub fn new(codebase_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            codebase_id: codebase_id.to_string(),
            phase: SyncPhase::Idle,
            progress: 0,
            message: "queued".to_string(),
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
            result: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id.clone(),
            codebase_id: self.codebase_id.clone(),
            phase: self.phase,
            progress: self.progress,
            message: self.message.clone(),
            errors: self.errors.clone(),
            result: self.result.clone(),
        }
    }

    /// Apply one progress event. Progress never decreases and terminal
    /// jobs ignore further events.
    pub fn apply(&mut self, event: &ProgressEvent) {
        if self.is_terminal() {
            return;
        }
        let now = Utc::now();
        match event {
            ProgressEvent::Phase {
                phase,
                progress,
                message,
                ..
            } => {
                // Terminal phases are entered through Finished / Failed,
                // which carry the result.
                if self.phase != *phase
                    && !phase.is_terminal()
                    && self.phase.can_transition_to(*phase)
                {
                    self.phase = *phase;
                }
                self.progress = self.progress.max(*progress);
                self.message = message.clone();
            }
            ProgressEvent::Batch {
                phase,
                progress,
                done,
                total,
                ..
            } => {
                self.progress = self.progress.max(*progress);
                self.message = format!("{} {}/{}", phase.as_str(), done, total);
            }
            ProgressEvent::Warning { message, .. } => self.errors.push(message.clone()),
            ProgressEvent::Finished { report, .. } => {
                self.phase = SyncPhase::Complete;
                self.progress = 100;
                self.message = report.outcome.as_str().to_string();
                self.result = Some(report.clone());
                self.finished_at = Some(now);
            }
            ProgressEvent::Failed { message, .. } => {
                self.phase = SyncPhase::Error;
                self.message = message.clone();
                self.errors.push(message.clone());
                self.finished_at = Some(now);
            }
        }
        self.updated_at = now;
    }
}

pub trait JobRegistry: Send + Sync {
    fn insert(&self, job: SyncJob) -> Result<()>;

    /// Replace the stored job with the same id.
    fn update(&self, job: &SyncJob) -> Result<()>;

    fn get(&self, id: &str) -> Result<Option<SyncJob>>;

    /// Evict terminal jobs that finished before `now - retention`.
    /// Returns how many were removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Most recently created job for a codebase.
    fn latest_for_codebase(&self, codebase_id: &str) -> Result<Option<SyncJob>>;
}

pub struct InMemoryJobRegistry {
    jobs: RwLock<HashMap<String, SyncJob>>,
    retention: Duration,
}

impl InMemoryJobRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobRegistry for InMemoryJobRegistry {
    fn insert(&self, job: SyncJob) -> Result<()> {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.id.clone(), job);
        Ok(())
    }

    fn update(&self, job: &SyncJob) -> Result<()> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => anyhow::bail!("unknown job '{}'", job.id),
        }
    }

    fn get(&self, id: &str) -> Result<Option<SyncJob>> {
        Ok(self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let retention = chrono::Duration::from_std(self.retention)?;
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let before = jobs.len();
        jobs.retain(|_, job| match job.finished_at {
            Some(finished) if job.is_terminal() => finished + retention > now,
            _ => true,
        });
        Ok(before - jobs.len())
    }

    fn latest_for_codebase(&self, codebase_id: &str) -> Result<Option<SyncJob>> {
        Ok(self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|j| j.codebase_id == codebase_id)
            .max_by_key(|j| j.created_at)
            .cloned())
    }
}

/// Folds a run's progress events into its job record.
pub struct JobRecorder {
    registry: Arc<dyn JobRegistry>,
    job_id: String,
}

impl JobRecorder {
    pub fn new(registry: Arc<dyn JobRegistry>, job_id: impl Into<String>) -> Self {
        Self {
            registry,
            job_id: job_id.into(),
        }
    }
}

impl ProgressObserver for JobRecorder {
    fn on_event(&self, event: &ProgressEvent) {
        let outcome = self.registry.get(&self.job_id).and_then(|job| match job {
            Some(mut job) => {
                job.apply(event);
                self.registry.update(&job)
            }
            None => Ok(()),
        });
        if let Err(e) = outcome {
            tracing::warn!(job = %self.job_id, error = %e, "failed to record job progress");
        }
    }
}

/// Purge expired jobs every `every` until the runtime shuts down.
pub fn spawn_janitor(registry: Arc<dyn JobRegistry>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
        loop {
            ticker.tick().await;
            match registry.purge_expired(Utc::now()) {
                Ok(0) => {}
                Ok(n) => tracing::debug!(purged = n, "evicted expired sync jobs"),
                Err(e) => tracing::warn!(error = %e, "job purge failed"),
            }
        }
    })
}
