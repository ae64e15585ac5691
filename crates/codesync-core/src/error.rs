//! Error taxonomy shared by every stage of a sync.
//!
//! [`SyncError`] separates the failure classes the orchestrator treats
//! differently:
//!
//! | Variant | Handling |
//! |---------|----------|
//! | `Validation` | Rejected immediately, no side effects |
//! | `TransientProvider` | Retried with bounded backoff, then downgraded to a warning |
//! | `FatalConfig` | Aborts the whole sync before any further write |
//! | `AlreadyRunning` | Concurrent request for a codebase that is mid-sync |
//! | `Repository` / `State` / `Index` | Collaborator failures; fatal when they occur outside per-item work |
//!
//! A partially successful sync is not an error: it finishes `Complete`
//! with a non-empty warning list.

use thiserror::Error;

/// Errors surfaced by the sync engine and its collaborators.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Bad input: signature mismatch, missing parameter, malformed payload.
    #[error("validation error: {0}")]
    Validation(String),

    /// Network failure or rate limit that may succeed on retry.
    #[error("transient provider error: {0}")]
    TransientProvider(String),

    /// Misconfiguration that no retry can fix (dimension mismatch, index never ready).
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    /// Another sync currently holds the lease for this codebase.
    #[error("a sync is already running for codebase '{0}'")]
    AlreadyRunning(String),

    /// Repository listing or blob retrieval failed.
    #[error("repository error: {0}")]
    Repository(String),

    /// Reading or writing the persisted sync record failed.
    #[error("sync state error: {0}")]
    State(String),

    /// The vector database rejected a control-plane or data-plane call.
    #[error("vector index error: {0}")]
    Index(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SyncError {
    /// Machine-readable code used in HTTP error bodies and job records.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Validation(_) => "validation",
            SyncError::TransientProvider(_) => "transient_provider",
            SyncError::FatalConfig(_) => "fatal_config",
            SyncError::AlreadyRunning(_) => "sync_in_progress",
            SyncError::Repository(_) => "repository",
            SyncError::State(_) => "sync_state",
            SyncError::Index(_) => "vector_index",
            SyncError::Internal(_) => "internal",
        }
    }

    /// Whether retrying the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientProvider(_))
    }
}

/// Failure reported by an embedding provider for one request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// HTTP 429, 5xx, timeouts, connection resets.
    #[error("transient: {0}")]
    Transient(String),
    /// Any other rejection; retrying the same input will fail again.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl From<ProviderError> for SyncError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(msg) => SyncError::TransientProvider(msg),
            ProviderError::Permanent(msg) => SyncError::Validation(msg),
        }
    }
}
