//! Push webhook ingestion and registration.
//!
//! `POST /webhooks/{codebase_id}` with GitHub's push payload:
//!
//! | Condition | Response |
//! |-----------|----------|
//! | Unknown codebase | 404 |
//! | Missing or wrong `X-Hub-Signature-256` | 401, nothing else happens |
//! | Not a `push` event, branch deleted, or not the default branch | 200, ignored |
//! | Sync already running for the codebase | 409 |
//! | Otherwise | 202 with the job id; the sync runs in the background |
//!
//! The signature is HMAC-SHA256 over the raw request body, hex-encoded as
//! `sha256=<hex>`, compared in constant time. The secret is the one stored
//! when the hook was registered, falling back to the environment variable
//! named by `webhook_secret_env`.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info};

use codesync_core::error::SyncError;

use crate::orchestrator::{SyncOrchestrator, SyncRequest};
use crate::repo::{RepositoryCatalog, RepositoryEntry};
use crate::sync_state::{RepositorySyncRecord, SyncStateStore, WebhookCredentials};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";

const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing or invalid webhook signature")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unknown codebase '{0}'")]
    UnknownCodebase(String),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Accepted { job_id: String },
    Ignored { reason: String },
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    after: Option<String>,
    #[serde(default)]
    deleted: bool,
    repository: Option<PayloadRepository>,
}

#[derive(Debug, Deserialize)]
struct PayloadRepository {
    #[serde(default, alias = "fullName")]
    full_name: Option<String>,
    #[serde(default, alias = "defaultBranch")]
    default_branch: Option<String>,
}

/// `sha256=<hex>` signature of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, hmac::digest::InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(hex_sig) = header.and_then(|h| h.trim().strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub struct WebhookIngestor {
    catalog: Arc<RepositoryCatalog>,
    state: Arc<dyn SyncStateStore>,
    orchestrator: SyncOrchestrator,
}

impl WebhookIngestor {
    pub fn new(
        catalog: Arc<RepositoryCatalog>,
        state: Arc<dyn SyncStateStore>,
        orchestrator: SyncOrchestrator,
    ) -> Self {
        Self {
            catalog,
            state,
            orchestrator,
        }
    }

    async fn secret_for(&self, entry: &RepositoryEntry) -> Result<Option<String>, WebhookError> {
        let record = self
            .state
            .get_sync_record(&entry.id)
            .await
            .map_err(|e| SyncError::State(format!("{:#}", e)))?;
        if let Some(creds) = record.and_then(|r| r.webhook) {
            return Ok(Some(creds.secret));
        }
        Ok(entry
            .webhook_secret_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|s| !s.is_empty()))
    }

    /// Verify and dispatch one delivery.
    pub async fn handle(
        &self,
        codebase_id: &str,
        event: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookOutcome, WebhookError> {
        let entry = self
            .catalog
            .get(codebase_id)
            .ok_or_else(|| WebhookError::UnknownCodebase(codebase_id.to_string()))?;

        let secret = self.secret_for(&entry).await?.ok_or(WebhookError::Unauthorized)?;
        if !verify_signature(&secret, body, signature) {
            return Err(WebhookError::Unauthorized);
        }

        match event {
            Some("push") => {}
            other => {
                return Ok(ignored(format!(
                    "event '{}' does not trigger a sync",
                    other.unwrap_or("unknown")
                )))
            }
        }

        let payload: PushPayload = serde_json::from_slice(body)
            .map_err(|e| WebhookError::BadRequest(format!("invalid push payload: {}", e)))?;

        let after = payload.after.unwrap_or_default();
        if payload.deleted || after.is_empty() || after == ZERO_SHA {
            return Ok(ignored("branch deleted".to_string()));
        }

        let Some(branch) = payload
            .git_ref
            .as_deref()
            .and_then(|r| r.strip_prefix("refs/heads/"))
        else {
            return Ok(ignored("not a branch push".to_string()));
        };

        let repository = payload.repository;
        if let Some(repo_default) = repository.as_ref().and_then(|r| r.default_branch.as_deref()) {
            if repo_default != entry.default_branch {
                debug!(
                    codebase = codebase_id,
                    configured = %entry.default_branch,
                    payload = repo_default,
                    "payload default branch differs from configuration"
                );
            }
        }
        if branch != entry.default_branch {
            return Ok(ignored(format!(
                "push to '{}' ignored; default branch is '{}'",
                branch, entry.default_branch
            )));
        }

        let job_id = self
            .orchestrator
            .start(SyncRequest::for_entry(&entry).at_ref(Some(after.clone())))?;
        let full_name = repository.and_then(|r| r.full_name).unwrap_or_default();
        info!(
            codebase = codebase_id,
            job = %job_id,
            commit = %after,
            repo = %full_name,
            "push accepted"
        );
        Ok(WebhookOutcome::Accepted { job_id })
    }
}

fn ignored(reason: String) -> WebhookOutcome {
    debug!(reason = %reason, "webhook ignored");
    WebhookOutcome::Ignored { reason }
}

/// Register a push hook for `codebase_id` delivering to `url`, with a fresh
/// secret stored in the codebase's sync record. Fails with
/// [`SyncError::AlreadyRunning`] while the codebase is syncing.
pub async fn register_webhook(
    catalog: &RepositoryCatalog,
    state: &dyn SyncStateStore,
    orchestrator: &SyncOrchestrator,
    codebase_id: &str,
    url: &str,
) -> anyhow::Result<WebhookCredentials> {
    let entry = catalog
        .get(codebase_id)
        .ok_or_else(|| anyhow::anyhow!("unknown codebase '{}'", codebase_id))?;

    orchestrator
        .exclusive(codebase_id, store_new_webhook(&entry, state, codebase_id, url))
        .await
}

async fn store_new_webhook(
    entry: &RepositoryEntry,
    state: &dyn SyncStateStore,
    codebase_id: &str,
    url: &str,
) -> anyhow::Result<WebhookCredentials> {
    let secret = format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    );
    let hook_id = entry.source.register_webhook(url, &secret).await?;
    let credentials = WebhookCredentials { hook_id, secret };

    let record = match state.get_sync_record(codebase_id).await? {
        Some(mut record) => {
            record.webhook = Some(credentials.clone());
            record
        }
        None => RepositorySyncRecord::unsynced(codebase_id, Some(credentials.clone())),
    };
    state.put_sync_record(&record).await?;
    info!(codebase = codebase_id, hook = %credentials.hook_id, "webhook registered");
    Ok(credentials)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_verify() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let sig = sign("s3cret", body).unwrap();
        assert!(sig.starts_with("sha256="));
        assert!(verify_signature("s3cret", body, Some(&sig)));
        assert!(!verify_signature("other", body, Some(&sig)));
        assert!(!verify_signature("s3cret", b"tampered", Some(&sig)));
        assert!(!verify_signature("s3cret", body, None));
        assert!(!verify_signature("s3cret", body, Some("sha1=abc")));
        assert!(!verify_signature("s3cret", body, Some("sha256=zz")));
    }

    #[test]
    fn payload_accepts_both_spellings() {
        let camel: PushPayload = serde_json::from_str(
            r#"{"ref":"refs/heads/main","after":"abc","repository":{"fullName":"acme/api","defaultBranch":"main"}}"#,
        )
        .unwrap();
        let snake: PushPayload = serde_json::from_str(
            r#"{"ref":"refs/heads/main","after":"abc","repository":{"full_name":"acme/api","default_branch":"main"}}"#,
        )
        .unwrap();
        for p in [camel, snake] {
            let repo = p.repository.unwrap();
            assert_eq!(repo.full_name.as_deref(), Some("acme/api"));
            assert_eq!(repo.default_branch.as_deref(), Some("main"));
        }
    }
}
