//! # codesync core
//!
//! Pure logic for keeping a vector index in step with a source repository:
//! Merkle snapshots, change sets, code chunking, metadata filters, and the
//! embedding and vector-database traits.
//!
//! This crate has no tokio, sqlx, HTTP, or filesystem dependencies. The
//! `codesync` app crate supplies the collaborators and drives the sync.

pub mod chunk;
pub mod diff;
pub mod embedding;
pub mod error;
pub mod filter;
pub mod merkle;
pub mod models;
pub mod store;
