//! Persisted "last synced state" per codebase.
//!
//! A [`RepositorySyncRecord`] is read once at the start of a sync and
//! written once at the end, after the vector index has accepted the
//! mutations it describes. A crash mid-sync therefore leaves the previous
//! record in place and the next sync re-diffs against it.
//!
//! Backends: [`SqliteSyncStateStore`] (the `sync_records` table) and
//! [`InMemorySyncStateStore`] for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use codesync_core::merkle::{MerkleTree, SerializedTree};

/// Shared secret and host-side id of a registered push webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookCredentials {
    pub hook_id: String,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySyncRecord {
    pub codebase_id: String,
    pub tree: SerializedTree,
    pub last_commit: Option<String>,
    /// Chunk ids currently in the index, per file path.
    pub chunk_manifest: BTreeMap<String, Vec<String>>,
    pub webhook: Option<WebhookCredentials>,
    /// RFC 3339.
    pub synced_at: String,
}

impl RepositorySyncRecord {
    /// A record holding only webhook credentials, before the first sync.
    pub fn unsynced(codebase_id: &str, webhook: Option<WebhookCredentials>) -> Self {
        Self {
            codebase_id: codebase_id.to_string(),
            tree: MerkleTree::empty().serialize(),
            last_commit: None,
            chunk_manifest: BTreeMap::new(),
            webhook,
            synced_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Whether a sync has ever completed for this codebase.
    pub fn is_synced(&self) -> bool {
        self.last_commit.is_some() || !self.tree.files.is_empty()
    }
}

#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn get_sync_record(&self, codebase_id: &str) -> Result<Option<RepositorySyncRecord>>;

    async fn put_sync_record(&self, record: &RepositorySyncRecord) -> Result<()>;

    /// Returns whether a record existed.
    async fn delete_sync_record(&self, codebase_id: &str) -> Result<bool>;
}

/// SQLite implementation over the `sync_records` table.
pub struct SqliteSyncStateStore {
    pool: SqlitePool,
}

impl SqliteSyncStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncStateStore for SqliteSyncStateStore {
    async fn get_sync_record(&self, codebase_id: &str) -> Result<Option<RepositorySyncRecord>> {
        let row = sqlx::query(
            "SELECT tree_json, last_commit, manifest_json, webhook_json, synced_at \
             FROM sync_records WHERE codebase_id = ?",
        )
        .bind(codebase_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let tree_json: String = row.get("tree_json");
        let manifest_json: String = row.get("manifest_json");
        let webhook_json: Option<String> = row.get("webhook_json");

        Ok(Some(RepositorySyncRecord {
            codebase_id: codebase_id.to_string(),
            tree: serde_json::from_str(&tree_json)
                .with_context(|| format!("corrupt tree_json for '{}'", codebase_id))?,
            last_commit: row.get("last_commit"),
            chunk_manifest: serde_json::from_str(&manifest_json)
                .with_context(|| format!("corrupt manifest_json for '{}'", codebase_id))?,
            webhook: webhook_json
                .map(|w| serde_json::from_str(&w))
                .transpose()
                .with_context(|| format!("corrupt webhook_json for '{}'", codebase_id))?,
            synced_at: row.get("synced_at"),
        }))
    }

    async fn put_sync_record(&self, record: &RepositorySyncRecord) -> Result<()> {
        let webhook_json = record
            .webhook
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO sync_records (codebase_id, root_hash, tree_json, last_commit,
                                      manifest_json, webhook_json, synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(codebase_id) DO UPDATE SET
                root_hash = excluded.root_hash,
                tree_json = excluded.tree_json,
                last_commit = excluded.last_commit,
                manifest_json = excluded.manifest_json,
                webhook_json = excluded.webhook_json,
                synced_at = excluded.synced_at
            "#,
        )
        .bind(&record.codebase_id)
        .bind(&record.tree.root_hash)
        .bind(serde_json::to_string(&record.tree)?)
        .bind(&record.last_commit)
        .bind(serde_json::to_string(&record.chunk_manifest)?)
        .bind(webhook_json)
        .bind(&record.synced_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_sync_record(&self, codebase_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sync_records WHERE codebase_id = ?")
            .bind(codebase_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// In-memory store; counts writes so tests can assert on them.
#[derive(Default)]
pub struct InMemorySyncStateStore {
    records: RwLock<HashMap<String, RepositorySyncRecord>>,
    puts: AtomicUsize,
}

impl InMemorySyncStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncStateStore for InMemorySyncStateStore {
    async fn get_sync_record(&self, codebase_id: &str) -> Result<Option<RepositorySyncRecord>> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(codebase_id)
            .cloned())
    }

    async fn put_sync_record(&self, record: &RepositorySyncRecord) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.codebase_id.clone(), record.clone());
        Ok(())
    }

    async fn delete_sync_record(&self, codebase_id: &str) -> Result<bool> {
        Ok(self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(codebase_id)
            .is_some())
    }
}
