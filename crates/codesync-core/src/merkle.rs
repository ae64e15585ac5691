//! Content-addressed snapshot of a repository tree.
//!
//! A [`MerkleTree`] is built from a flat list of files. Each file carries a
//! content hash; each directory carries an aggregate hash computed from its
//! children **sorted by name**, so the root hash depends only on the set of
//! `(path, content)` pairs and never on the order files were listed in.
//!
//! # Hashing
//!
//! ```text
//! file hash      = sha256(raw bytes)                 (or a blob id from the host)
//! directory hash = sha256( for child in sorted(children):
//!                            kind_tag ‖ name ‖ 0x00 ‖ child_hash ‖ '\n' )
//! ```
//!
//! `kind_tag` is `f` or `d`, which keeps a file named `x` distinct from a
//! directory named `x` with the same hash. An empty file hashes to the
//! SHA-256 of zero-length input; binary files hash their raw bytes.
//!
//! # Persistence
//!
//! [`SerializedTree`] is the flat `(path, hash)` list plus the root hash.
//! [`MerkleTree::from_serialized`] rebuilds the hierarchy and refuses the
//! payload if the rebuilt root does not match, so a corrupted record is
//! caught before it is diffed against.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::sha256_hex;

/// Version tag written into [`SerializedTree`].
pub const SERIALIZED_TREE_VERSION: u32 = 1;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MerkleError {
    #[error("empty file path")]
    EmptyPath,
    #[error("duplicate file path: {0}")]
    DuplicatePath(String),
    #[error("path '{0}' is both a file and a directory")]
    PathConflict(String),
    #[error("serialized tree root mismatch: stored {stored}, rebuilt {rebuilt}")]
    RootMismatch { stored: String, rebuilt: String },
    #[error("unsupported serialized tree version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Dir,
}

/// One node of the hierarchy. Children are always sorted by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    /// Path segment (empty for the root).
    pub name: String,
    pub kind: NodeKind,
    /// Content hash for files, aggregate hash for directories.
    pub hash: String,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }
}

/// A file as listed by the repository: normalized path plus content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub content_hash: String,
    #[serde(default)]
    pub size: u64,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, content_hash: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            content_hash: content_hash.into(),
            size,
        }
    }

    /// Hash raw file bytes into an entry.
    pub fn from_bytes(path: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            path: path.into(),
            content_hash: sha256_hex(bytes),
            size: bytes.len() as u64,
        }
    }
}

/// Flat persisted form of a [`MerkleTree`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedTree {
    pub version: u32,
    pub root_hash: String,
    pub files: Vec<SerializedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedFile {
    pub path: String,
    pub hash: String,
}

/// Immutable snapshot of one repository ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    root: TreeNode,
    files: BTreeMap<String, String>,
}

/// Normalize a repository path: forward slashes, no leading `./` or `/`,
/// no empty segments.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    unified
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Build a tree from file entries. Order of `entries` does not matter.
pub fn build_tree<I>(entries: I) -> Result<MerkleTree, MerkleError>
where
    I: IntoIterator<Item = FileEntry>,
{
    let mut files = BTreeMap::new();
    for entry in entries {
        let path = normalize_path(&entry.path);
        if path.is_empty() {
            return Err(MerkleError::EmptyPath);
        }
        if files.insert(path.clone(), entry.content_hash).is_some() {
            return Err(MerkleError::DuplicatePath(path));
        }
    }
    MerkleTree::from_map(files)
}

/// Build a tree by hashing raw contents.
pub fn build_tree_from_contents<'a, I>(contents: I) -> Result<MerkleTree, MerkleError>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    build_tree(
        contents
            .into_iter()
            .map(|(path, bytes)| FileEntry::from_bytes(path, bytes)),
    )
}

enum Building {
    File(String),
    Dir(BTreeMap<String, Building>),
}

impl MerkleTree {
    /// An empty snapshot (repository with no files).
    pub fn empty() -> Self {
        Self {
            root: fold(String::new(), BTreeMap::new()),
            files: BTreeMap::new(),
        }
    }

    fn from_map(files: BTreeMap<String, String>) -> Result<Self, MerkleError> {
        for path in files.keys() {
            let mut idx = 0;
            while let Some(pos) = path[idx..].find('/') {
                let ancestor = &path[..idx + pos];
                if files.contains_key(ancestor) {
                    return Err(MerkleError::PathConflict(ancestor.to_string()));
                }
                idx += pos + 1;
            }
        }

        let mut top: BTreeMap<String, Building> = BTreeMap::new();
        for (path, hash) in &files {
            let segments: Vec<&str> = path.split('/').collect();
            let (leaf, dirs) = segments
                .split_last()
                .ok_or(MerkleError::EmptyPath)?;
            let mut level = &mut top;
            for dir in dirs {
                let slot = level
                    .entry(dir.to_string())
                    .or_insert_with(|| Building::Dir(BTreeMap::new()));
                level = match slot {
                    Building::Dir(children) => children,
                    Building::File(_) => return Err(MerkleError::PathConflict(path.clone())),
                };
            }
            level.insert(leaf.to_string(), Building::File(hash.clone()));
        }

        Ok(Self {
            root: fold(String::new(), top),
            files,
        })
    }

    pub fn root(&self) -> &TreeNode {
        &self.root
    }

    pub fn root_hash(&self) -> &str {
        &self.root.hash
    }

    /// Flat `path → content hash` view, sorted by path.
    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.files
    }

    pub fn file_hash(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Flat persisted form.
    pub fn serialize(&self) -> SerializedTree {
        SerializedTree {
            version: SERIALIZED_TREE_VERSION,
            root_hash: self.root.hash.clone(),
            files: self
                .files
                .iter()
                .map(|(path, hash)| SerializedFile {
                    path: path.clone(),
                    hash: hash.clone(),
                })
                .collect(),
        }
    }

    /// Rebuild from the persisted form, verifying the root hash.
    pub fn from_serialized(serialized: &SerializedTree) -> Result<Self, MerkleError> {
        if serialized.version != SERIALIZED_TREE_VERSION {
            return Err(MerkleError::UnsupportedVersion(serialized.version));
        }
        let tree = build_tree(
            serialized
                .files
                .iter()
                .map(|f| FileEntry::new(f.path.clone(), f.hash.clone(), 0)),
        )?;
        if tree.root_hash() != serialized.root_hash {
            return Err(MerkleError::RootMismatch {
                stored: serialized.root_hash.clone(),
                rebuilt: tree.root_hash().to_string(),
            });
        }
        Ok(tree)
    }

    /// Copy of this tree with some paths overridden: `Some(hash)` sets the
    /// path's hash, `None` removes it.
    pub fn with_overrides(
        &self,
        overrides: &BTreeMap<String, Option<String>>,
    ) -> Result<Self, MerkleError> {
        let mut files = self.files.clone();
        for (path, hash) in overrides {
            match hash {
                Some(h) => {
                    files.insert(path.clone(), h.clone());
                }
                None => {
                    files.remove(path);
                }
            }
        }
        Self::from_map(files)
    }
}

fn fold(name: String, children: BTreeMap<String, Building>) -> TreeNode {
    let nodes: Vec<TreeNode> = children
        .into_iter()
        .map(|(child_name, building)| match building {
            Building::File(hash) => TreeNode {
                name: child_name,
                kind: NodeKind::File,
                hash,
                children: Vec::new(),
            },
            Building::Dir(grandchildren) => fold(child_name, grandchildren),
        })
        .collect();

    let mut hasher = Sha256::new();
    for node in &nodes {
        hasher.update(match node.kind {
            NodeKind::File => b"f",
            NodeKind::Dir => b"d",
        });
        hasher.update(node.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(node.hash.as_bytes());
        hasher.update(b"\n");
    }

    TreeNode {
        name,
        kind: NodeKind::Dir,
        hash: format!("{:x}", hasher.finalize()),
        children: nodes,
    }
}
