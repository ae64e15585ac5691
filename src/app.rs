//! Application wiring.
//!
//! [`AppContext`] owns one instance of every collaborator and is shared by
//! the CLI commands and the HTTP server. [`AppContext::from_config`] builds
//! the production stack (SQLite state, configured embedding provider and
//! vector database); [`AppContext::assemble`] takes prebuilt parts, which is
//! how the integration tests run the whole pipeline in-process.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use codesync_core::embedding::EmbeddingProvider;
use codesync_core::error::SyncError;
use codesync_core::store::VectorDatabase;

use crate::config::Config;
use crate::db;
use crate::embedder::{Embedder, EmbedderConfig};
use crate::embedding::create_provider;
use crate::jobs::{InMemoryJobRegistry, JobRegistry, JobStatus};
use crate::migrate;
use crate::orchestrator::{OrchestratorParts, SyncOrchestrator};
use crate::progress::ProgressObserver;
use crate::repo::RepositoryCatalog;
use crate::sync_state::{RepositorySyncRecord, SqliteSyncStateStore, SyncStateStore};
use crate::vector_index::{create_database, IndexSettings, VectorIndexClient};
use crate::webhook::WebhookIngestor;

/// Prebuilt collaborators for [`AppContext::assemble`].
pub struct AppParts {
    pub catalog: RepositoryCatalog,
    pub state: Arc<dyn SyncStateStore>,
    pub database: Arc<dyn VectorDatabase>,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub observers: Vec<Arc<dyn ProgressObserver>>,
}

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub catalog: Arc<RepositoryCatalog>,
    pub state: Arc<dyn SyncStateStore>,
    pub jobs: Arc<dyn JobRegistry>,
    pub index: VectorIndexClient,
    pub orchestrator: SyncOrchestrator,
    pub webhooks: Arc<WebhookIngestor>,
}

/// Snapshot returned by `codesync status` and `GET /codebases/{id}/status`.
#[derive(Debug, Clone, Serialize)]
pub struct CodebaseStatus {
    pub codebase_id: String,
    pub synced: bool,
    pub syncing: bool,
    pub last_commit: Option<String>,
    pub synced_at: Option<String>,
    pub root_hash: Option<String>,
    pub files: usize,
    pub indexed_chunks: usize,
    pub webhook_registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_job: Option<JobStatus>,
}

impl AppContext {
    pub async fn from_config(config: &Config, observers: Vec<Arc<dyn ProgressObserver>>) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;

        Ok(Self::assemble(
            config.clone(),
            AppParts {
                catalog: RepositoryCatalog::from_config(config)?,
                state: Arc::new(SqliteSyncStateStore::new(pool)),
                database: create_database(&config.index)?,
                provider: create_provider(&config.embedding)?,
                observers,
            },
        ))
    }

    pub fn assemble(config: Config, parts: AppParts) -> Self {
        let index = VectorIndexClient::new(parts.database, IndexSettings::from(&config.index));
        let embedder = Arc::new(Embedder::new(
            parts.provider,
            EmbedderConfig::from(&config.embedding),
        ));
        let jobs: Arc<dyn JobRegistry> =
            Arc::new(InMemoryJobRegistry::new(config.sync.job_retention()));
        let orchestrator = SyncOrchestrator::new(OrchestratorParts {
            state: parts.state.clone(),
            index: index.clone(),
            embedder,
            chunker: codesync_core::chunk::Chunker::new(config.chunking.chunker_config()),
            jobs: jobs.clone(),
            observers: parts.observers,
            fetch_concurrency: config.sync.fetch_concurrency,
        });
        let catalog = Arc::new(parts.catalog);
        let webhooks = Arc::new(WebhookIngestor::new(
            catalog.clone(),
            parts.state.clone(),
            orchestrator.clone(),
        ));

        Self {
            config: Arc::new(config),
            catalog,
            state: parts.state,
            jobs,
            index,
            orchestrator,
            webhooks,
        }
    }

    pub async fn codebase_status(&self, codebase_id: &str) -> Result<CodebaseStatus> {
        let record = self.state.get_sync_record(codebase_id).await?;
        let indexed_chunks = record
            .as_ref()
            .map(|r| r.chunk_manifest.values().map(Vec::len).sum())
            .unwrap_or(0);
        let latest_job = self
            .jobs
            .latest_for_codebase(codebase_id)?
            .map(|j| j.status());

        Ok(CodebaseStatus {
            codebase_id: codebase_id.to_string(),
            synced: record.as_ref().is_some_and(RepositorySyncRecord::is_synced),
            syncing: self.orchestrator.is_syncing(codebase_id),
            last_commit: record.as_ref().and_then(|r| r.last_commit.clone()),
            synced_at: record.as_ref().map(|r| r.synced_at.clone()),
            root_hash: record.as_ref().map(|r| r.tree.root_hash.clone()),
            files: record.as_ref().map(|r| r.tree.files.len()).unwrap_or(0),
            indexed_chunks,
            webhook_registered: record.as_ref().is_some_and(|r| r.webhook.is_some()),
            latest_job,
        })
    }

    /// Remove a codebase's vectors and sync state. Webhook credentials
    /// survive so deliveries keep verifying. Holds the codebase's sync lease
    /// throughout.
    pub async fn purge(&self, codebase_id: &str) -> Result<usize, SyncError> {
        self.orchestrator
            .exclusive(codebase_id, self.purge_unlocked(codebase_id))
            .await
    }

    async fn purge_unlocked(&self, codebase_id: &str) -> Result<usize, SyncError> {
        let deleted = self.index.delete_by_codebase(codebase_id).await?;
        let record = self
            .state
            .get_sync_record(codebase_id)
            .await
            .map_err(|e| SyncError::State(format!("{:#}", e)))?;
        let result = match record.and_then(|r| r.webhook) {
            Some(webhook) => {
                self.state
                    .put_sync_record(&RepositorySyncRecord::unsynced(codebase_id, Some(webhook)))
                    .await
            }
            None => self.state.delete_sync_record(codebase_id).await.map(|_| ()),
        };
        result.map_err(|e| SyncError::State(format!("{:#}", e)))?;
        Ok(deleted)
    }
}
