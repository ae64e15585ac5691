//! Core data models shared between the core library and the app crate.
//!
//! These types describe what flows through a sync: chunks cut from changed
//! files, the embeddings computed for them, and the vector records written
//! to the index.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Maximum number of characters of chunk content stored as a preview.
pub const CONTENT_PREVIEW_CHARS: usize = 200;

/// The syntactic shape a chunk was cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    /// A function, method, or closure bound at top level.
    Function,
    /// A class, struct, trait, interface, enum, or impl block.
    Class,
    /// A run of top-level statements between syntactic units.
    Block,
    /// A fixed-size line window from the fallback splitter.
    Window,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Function => "function",
            ChunkKind::Class => "class",
            ChunkKind::Block => "block",
            ChunkKind::Window => "window",
        }
    }
}

/// Language and dependency metadata extracted alongside each chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub language: String,
    /// Rough cyclomatic complexity: 1 + number of branch points.
    pub complexity: u32,
    pub keywords: Vec<String>,
    pub imports: Vec<String>,
    pub exports: Vec<String>,
    /// Module specifiers referenced by `imports`.
    pub dependencies: Vec<String>,
}

/// A semantically bounded slice of one file.
///
/// `start_line` and `end_line` are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeChunk {
    pub id: String,
    pub file_path: String,
    pub kind: ChunkKind,
    pub name: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    /// SHA-256 hex of `content`.
    pub content_hash: String,
    pub metadata: ChunkMetadata,
    /// Id of the enclosing chunk when a large container was split.
    pub parent: Option<String>,
}

/// Hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Deterministic chunk id over `(path, range, content)`.
///
/// Identical content at the same location always reproduces the same id,
/// which is what lets a resync recognise chunks it has already embedded.
pub fn chunk_id(file_path: &str, start_line: usize, end_line: usize, content_hash: &str) -> String {
    sha256_hex(format!("{}:{}:{}:{}", file_path, start_line, end_line, content_hash).as_bytes())
}

/// Output of the embedder for one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingResult {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    /// Provider/model tag, e.g. `"openai/text-embedding-3-small"`.
    pub model: String,
    /// The chunk text was cut to the provider's input limit before embedding.
    pub truncated: bool,
}

/// Metadata stored next to every vector in the index.
///
/// Field names double as the filterable schema in [`crate::filter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub codebase_id: String,
    pub file_path: String,
    pub obfuscated_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub language: String,
    pub chunk_kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// RFC 3339 timestamp of the sync that wrote this vector.
    pub indexed_at: String,
    pub content_preview: String,
    #[serde(default)]
    pub truncated: bool,
}

/// A vector ready to be written to the index. `id` is the chunk id.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: VectorMetadata,
}

impl VectorRecord {
    /// Pair a chunk with its embedding under a codebase.
    pub fn from_chunk(
        codebase_id: &str,
        chunk: &CodeChunk,
        embedding: EmbeddingResult,
        commit: Option<&str>,
        indexed_at: &str,
    ) -> Self {
        VectorRecord {
            id: chunk.id.clone(),
            values: embedding.vector,
            metadata: VectorMetadata {
                codebase_id: codebase_id.to_string(),
                file_path: chunk.file_path.clone(),
                obfuscated_path: obfuscate_path(&chunk.file_path),
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                language: chunk.metadata.language.clone(),
                chunk_kind: chunk.kind.as_str().to_string(),
                name: chunk.name.clone(),
                commit: commit.map(str::to_string),
                indexed_at: indexed_at.to_string(),
                content_preview: content_preview(&chunk.content),
                truncated: embedding.truncated,
            },
        }
    }
}

/// A match returned from a vector query.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    pub metadata: Option<VectorMetadata>,
}

/// First [`CONTENT_PREVIEW_CHARS`] characters of `content`.
pub fn content_preview(content: &str) -> String {
    content.chars().take(CONTENT_PREVIEW_CHARS).collect()
}

/// Replace every directory and file stem with a short hash, keeping the
/// extension so language filters still work.
///
/// `src/auth/login.ts` becomes something like `3f2a9c1b/0b7e44d2/9a1c3e5f.ts`.
/// The mapping is deterministic but not reversible.
pub fn obfuscate_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let last = segments.len().saturating_sub(1);
    segments
        .iter()
        .enumerate()
        .map(|(i, segment)| {
            if i == last {
                match segment.rsplit_once('.') {
                    Some((stem, ext)) if !stem.is_empty() => {
                        format!("{}.{}", &sha256_hex(stem.as_bytes())[..8], ext)
                    }
                    _ => sha256_hex(segment.as_bytes())[..8].to_string(),
                }
            } else {
                sha256_hex(segment.as_bytes())[..8].to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}
