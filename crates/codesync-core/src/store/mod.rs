//! Vector database abstraction.
//!
//! The [`VectorDatabase`] trait is the narrow surface the vector index
//! client needs: index lifecycle on the control plane, and upsert, delete,
//! and filtered query on the data plane. Backends: the Pinecone-compatible
//! HTTP database in the app crate, and [`memory::InMemoryVectorDatabase`].
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Operations
//!
//! | Method | Plane | Purpose |
//! |--------|-------|---------|
//! | [`describe_index`](VectorDatabase::describe_index) | control | Dimension and readiness, `None` if absent |
//! | [`create_index`](VectorDatabase::create_index) | control | Create with a dimension |
//! | [`delete_index`](VectorDatabase::delete_index) | control | Drop the index and all vectors |
//! | [`upsert`](VectorDatabase::upsert) | data | Insert or replace records by id |
//! | [`delete`](VectorDatabase::delete) | data | Delete by explicit id list |
//! | [`query`](VectorDatabase::query) | data | Nearest neighbours under a metadata filter |

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::filter::Filter;
use crate::models::{VectorMatch, VectorRecord};

/// State of the index as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescription {
    pub name: String,
    pub dimension: usize,
    pub ready: bool,
}

#[async_trait]
pub trait VectorDatabase: Send + Sync {
    async fn describe_index(&self) -> Result<Option<IndexDescription>>;

    async fn create_index(&self, dimension: usize) -> Result<()>;

    async fn delete_index(&self) -> Result<()>;

    async fn upsert(&self, records: &[VectorRecord]) -> Result<()>;

    async fn delete(&self, ids: &[String]) -> Result<()>;

    /// Return up to `top_k` matches with metadata, best first.
    async fn query(&self, vector: &[f32], filter: &Filter, top_k: usize) -> Result<Vec<VectorMatch>>;
}
