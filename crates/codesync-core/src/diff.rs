//! Change detection between two [`MerkleTree`] snapshots.
//!
//! The reference semantics is the flat comparison in [`diff_flat`]:
//!
//! - a path only in `new` is **added**
//! - a path only in `old` is **deleted**
//! - a path in both with a different content hash is **modified**
//!
//! [`diff`] produces exactly the same [`ChangeSet`] but walks both
//! hierarchies in step and skips any directory whose aggregate hash is
//! unchanged. That skip is purely an optimization; nothing downstream may
//! rely on more than what the flat comparison guarantees.

use serde::{Deserialize, Serialize};

use crate::merkle::{MerkleTree, NodeKind, TreeNode};

/// Paths that differ between two snapshots, each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn total_changes(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_changes() == 0
    }

    /// `added ∪ modified`: the files whose new content must be indexed.
    pub fn to_index(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(self.modified.iter())
    }

    /// Every changed path. Any of them may own vectors from an earlier sync.
    pub fn touched(&self) -> impl Iterator<Item = &String> {
        self.to_index().chain(self.deleted.iter())
    }

    fn finish(mut self) -> Self {
        self.added.sort();
        self.modified.sort();
        self.deleted.sort();
        self
    }
}

/// Flat `(path, hash)` comparison.
pub fn diff_flat(old: &MerkleTree, new: &MerkleTree) -> ChangeSet {
    let mut changes = ChangeSet::default();
    for (path, hash) in new.files() {
        match old.file_hash(path) {
            None => changes.added.push(path.clone()),
            Some(previous) if previous != hash => changes.modified.push(path.clone()),
            Some(_) => {}
        }
    }
    for path in old.files().keys() {
        if new.file_hash(path).is_none() {
            changes.deleted.push(path.clone());
        }
    }
    changes.finish()
}

/// Hierarchical comparison with unchanged-subtree short-circuiting.
pub fn diff(old: &MerkleTree, new: &MerkleTree) -> ChangeSet {
    let mut changes = ChangeSet::default();
    if old.root_hash() == new.root_hash() {
        return changes;
    }
    walk_dirs(old.root(), new.root(), "", &mut changes);
    changes.finish()
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

fn walk_dirs(old: &TreeNode, new: &TreeNode, prefix: &str, out: &mut ChangeSet) {
    if old.hash == new.hash {
        return;
    }

    let (mut i, mut j) = (0, 0);
    while i < old.children.len() || j < new.children.len() {
        let o = old.children.get(i);
        let n = new.children.get(j);
        match (o, n) {
            (Some(o), Some(n)) if o.name == n.name => {
                compare(o, n, &join(prefix, &o.name), out);
                i += 1;
                j += 1;
            }
            (Some(o), Some(n)) if o.name < n.name => {
                collect(o, &join(prefix, &o.name), &mut out.deleted);
                i += 1;
            }
            (Some(_), Some(n)) => {
                collect(n, &join(prefix, &n.name), &mut out.added);
                j += 1;
            }
            (Some(o), None) => {
                collect(o, &join(prefix, &o.name), &mut out.deleted);
                i += 1;
            }
            (None, Some(n)) => {
                collect(n, &join(prefix, &n.name), &mut out.added);
                j += 1;
            }
            (None, None) => break,
        }
    }
}

fn compare(old: &TreeNode, new: &TreeNode, path: &str, out: &mut ChangeSet) {
    match (old.kind, new.kind) {
        (NodeKind::Dir, NodeKind::Dir) => walk_dirs(old, new, path, out),
        (NodeKind::File, NodeKind::File) => {
            if old.hash != new.hash {
                out.modified.push(path.to_string());
            }
        }
        _ => {
            collect(old, path, &mut out.deleted);
            collect(new, path, &mut out.added);
        }
    }
}

fn collect(node: &TreeNode, path: &str, into: &mut Vec<String>) {
    match node.kind {
        NodeKind::File => into.push(path.to_string()),
        NodeKind::Dir => {
            for child in &node.children {
                collect(child, &join(path, &child.name), into);
            }
        }
    }
}
