#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use codesync::app::{AppContext, AppParts};
use codesync::config::parse_config;
use codesync::jobs::SyncJob;
use codesync::orchestrator::SyncRequest;
use codesync::repo::{InMemoryRepository, PathFilter, RepositoryCatalog, RepositoryEntry};
use codesync::sync_state::{
    InMemorySyncStateStore, RepositorySyncRecord, SyncStateStore, WebhookCredentials,
};
use codesync_core::embedding::EmbeddingProvider;
use codesync_core::error::ProviderError;
use codesync_core::store::memory::InMemoryVectorDatabase;

pub const CODEBASE: &str = "acme-api";
pub const DIMS: usize = 8;
pub const SECRET: &str = "it-is-a-secret";

/// Deterministic embedding provider that counts what it was asked to do.
pub struct MockProvider {
    declared: usize,
    returned: usize,
    calls: AtomicUsize,
    texts: AtomicUsize,
    /// Batches with a text containing this fail permanently.
    fail_on: Mutex<Option<String>>,
}

impl MockProvider {
    pub fn new(dims: usize) -> Self {
        Self::returning(dims, dims)
    }

    /// Declares `declared` dimensions but produces vectors of `returned`.
    pub fn returning(declared: usize, returned: usize) -> Self {
        Self {
            declared,
            returned,
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
            fail_on: Mutex::new(None),
        }
    }

    pub fn fail_texts_containing(&self, needle: &str) {
        *self.fail_on.lock().unwrap() = Some(needle.to_string());
    }

    pub fn clear_failures(&self) {
        *self.fail_on.lock().unwrap() = None;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn texts(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
    fn model_name(&self) -> &str {
        "mock-embed"
    }

    fn dims(&self) -> usize {
        self.declared
    }

    fn max_batch_size(&self) -> usize {
        4
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        let fail_on = self.fail_on.lock().unwrap().clone();
        if let Some(needle) = fail_on {
            if texts.iter().any(|t| t.contains(&needle)) {
                return Err(ProviderError::Permanent(format!("input rejected: {}", needle)));
            }
        }
        Ok(texts
            .iter()
            .map(|text| {
                let seed = text
                    .bytes()
                    .fold(17u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
                (0..self.returned)
                    .map(|i| ((seed.wrapping_add(i as u32 * 7919) % 97) as f32 + 1.0) / 98.0)
                    .collect()
            })
            .collect())
    }
}

pub struct Fixture {
    pub ctx: AppContext,
    pub repo: Arc<InMemoryRepository>,
    pub db: Arc<InMemoryVectorDatabase>,
    pub state: Arc<InMemorySyncStateStore>,
    pub provider: Arc<MockProvider>,
}

impl Fixture {
    pub fn request(&self) -> SyncRequest {
        let entry = self.ctx.catalog.get(CODEBASE).expect("fixture codebase");
        SyncRequest::for_entry(&entry)
    }

    pub async fn wait_for_job(&self, job_id: &str) -> SyncJob {
        for _ in 0..500 {
            if let Some(job) = self.ctx.jobs.get(job_id).unwrap() {
                if job.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", job_id);
    }

    /// A second context over the same repository, index and state, with a
    /// different embedding provider.
    pub fn with_provider(&self, provider: MockProvider) -> Fixture {
        assemble(self.repo.clone(), self.db.clone(), self.state.clone(), Arc::new(provider))
    }

    /// Store webhook credentials the way `hook register` would.
    pub async fn register_secret(&self) {
        self.state
            .put_sync_record(&RepositorySyncRecord::unsynced(
                CODEBASE,
                Some(WebhookCredentials {
                    hook_id: "hook-1".to_string(),
                    secret: SECRET.to_string(),
                }),
            ))
            .await
            .unwrap();
    }
}

pub fn test_config(db_path: &str) -> codesync::config::Config {
    parse_config(&format!(
        r#"
[db]
path = "{}"

[embedding]
backoff_ms = 1
max_attempts = 2

[index]
upsert_delay_ms = 0
ready_poll_ms = 5
ready_timeout_secs = 2
"#,
        db_path
    ))
    .unwrap()
}

pub fn fixture(files: &[(&str, &str)]) -> Fixture {
    fixture_with_provider(files, MockProvider::new(DIMS))
}

pub fn fixture_with_provider(files: &[(&str, &str)], provider: MockProvider) -> Fixture {
    assemble(
        Arc::new(InMemoryRepository::with_files(files.iter().copied())),
        Arc::new(InMemoryVectorDatabase::new()),
        Arc::new(InMemorySyncStateStore::new()),
        Arc::new(provider),
    )
}

fn assemble(
    repo: Arc<InMemoryRepository>,
    db: Arc<InMemoryVectorDatabase>,
    state: Arc<InMemorySyncStateStore>,
    provider: Arc<MockProvider>,
) -> Fixture {
    let mut catalog = RepositoryCatalog::new();
    catalog.insert(RepositoryEntry {
        id: CODEBASE.to_string(),
        source: repo.clone(),
        default_branch: "main".to_string(),
        webhook_secret_env: None,
        paths: PathFilter::allow_all().unwrap(),
    });

    let ctx = AppContext::assemble(
        test_config("unused.sqlite"),
        AppParts {
            catalog,
            state: state.clone(),
            database: db.clone(),
            provider: provider.clone(),
            observers: Vec::new(),
        },
    );

    Fixture {
        ctx,
        repo,
        db,
        state,
        provider,
    }
}

pub const A_TS: &str = "import { b } from './b';\n\nexport function one(): number {\n  return b() + 1;\n}\n\nexport function two(): number {\n  return 2;\n}\n";

pub const B_TS: &str = "export function b(): number {\n  return 41;\n}\n";
