//! # codesync
//!
//! Keeps a vector index of code chunks in step with a source repository,
//! re-embedding only what changed since the last sync.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌─────────────────────────────────┐   ┌──────────────┐
//! │ Repository │──▶│ Merkle diff  │──▶│ Chunk → Embed → Delete + Upsert │──▶│ Vector index │
//! │ git/GitHub │   │ vs last sync │   │     (sync orchestrator)         │   │ Pinecone/mem │
//! └─────▲──────┘   └──────────────┘   └───────────────┬─────────────────┘   └──────────────┘
//!       │                                              ▼
//!  ┌────┴─────┐                               ┌────────────────┐
//!  │ webhook  │                               │ SQLite: sync   │
//!  │ / CLI    │                               │ records        │
//!  └──────────┘                               └────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! codesync init                          # create database
//! codesync sync acme-api                 # incremental sync of one codebase
//! codesync hook register acme-api --url https://sync.example.com
//! codesync serve                         # webhook + job polling server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sync_state`] | Persisted per-codebase sync records |
//! | [`repo`] | Repository sources (local git, GitHub, in-memory) and path globs |
//! | [`embedding`] | OpenAI / Ollama embedding providers |
//! | [`embedder`] | Batching, retry and dimension checks over a provider |
//! | [`vector_index`] | Index lifecycle and bulk operations over a vector database |
//! | [`pinecone`] | Pinecone-compatible HTTP vector database |
//! | [`orchestrator`] | The sync state machine |
//! | [`progress`] | Phases, progress events, CLI reporters |
//! | [`jobs`] | Pollable job registry |
//! | [`webhook`] | Signed push ingestion and hook registration |
//! | [`app`] | Wiring of all of the above |
//! | [`server`] | HTTP API |
//!
//! Pure logic (Merkle trees, diffing, chunking, filters, traits) lives in
//! the `codesync-core` crate.

pub mod app;
pub mod config;
pub mod db;
pub mod embedder;
pub mod embedding;
pub mod jobs;
pub mod migrate;
pub mod orchestrator;
pub mod pinecone;
pub mod progress;
pub mod repo;
pub mod server;
pub mod sync_state;
pub mod vector_index;
pub mod webhook;
