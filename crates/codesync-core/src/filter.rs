//! Metadata filter expressions for vector queries.
//!
//! A [`Filter`] is a small closed expression type over a fixed field
//! schema ([`Field`]). It is validated before use and rendered to the
//! Pinecone-style JSON dialect (`$eq`, `$in`, `$and`) by [`Filter::to_json`].
//! In-process backends evaluate it directly with [`Filter::matches`].

use serde_json::{json, Map, Value};

use crate::error::SyncError;
use crate::models::VectorMetadata;

/// Filterable metadata fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    CodebaseId,
    FilePath,
    Language,
    ChunkKind,
}

impl Field {
    /// Metadata key as stored next to each vector.
    pub fn key(&self) -> &'static str {
        match self {
            Field::CodebaseId => "codebase_id",
            Field::FilePath => "file_path",
            Field::Language => "language",
            Field::ChunkKind => "chunk_kind",
        }
    }

    fn value_of<'m>(&self, meta: &'m VectorMetadata) -> &'m str {
        match self {
            Field::CodebaseId => &meta.codebase_id,
            Field::FilePath => &meta.file_path,
            Field::Language => &meta.language,
            Field::ChunkKind => &meta.chunk_kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Eq(Field, String),
    In(Field, Vec<String>),
    And(Vec<Filter>),
}

impl Filter {
    pub fn codebase(id: &str) -> Self {
        Filter::Eq(Field::CodebaseId, id.to_string())
    }

    /// Vectors of one file within one codebase.
    pub fn file(codebase_id: &str, path: &str) -> Self {
        Filter::And(vec![
            Filter::codebase(codebase_id),
            Filter::Eq(Field::FilePath, path.to_string()),
        ])
    }

    /// Reject shapes that a vector database would silently misinterpret:
    /// empty conjunctions, empty sets, and empty codebase ids.
    pub fn validate(&self) -> Result<(), SyncError> {
        match self {
            Filter::Eq(Field::CodebaseId, v) if v.is_empty() => Err(SyncError::Validation(
                "filter on empty codebase_id".to_string(),
            )),
            Filter::Eq(..) => Ok(()),
            Filter::In(field, values) if values.is_empty() => Err(SyncError::Validation(
                format!("empty $in set for '{}'", field.key()),
            )),
            Filter::In(..) => Ok(()),
            Filter::And(parts) if parts.is_empty() => {
                Err(SyncError::Validation("empty $and".to_string()))
            }
            Filter::And(parts) => parts.iter().try_for_each(Filter::validate),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Filter::Eq(field, v) => {
                let mut m = Map::new();
                m.insert(field.key().to_string(), json!({ "$eq": v }));
                Value::Object(m)
            }
            Filter::In(field, vs) => {
                let mut m = Map::new();
                m.insert(field.key().to_string(), json!({ "$in": vs }));
                Value::Object(m)
            }
            Filter::And(parts) => {
                json!({ "$and": parts.iter().map(Filter::to_json).collect::<Vec<_>>() })
            }
        }
    }

    pub fn matches(&self, meta: &VectorMetadata) -> bool {
        match self {
            Filter::Eq(field, v) => field.value_of(meta) == v,
            Filter::In(field, vs) => vs.iter().any(|v| field.value_of(meta) == v),
            Filter::And(parts) => parts.iter().all(|p| p.matches(meta)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(codebase: &str, path: &str, lang: &str) -> VectorMetadata {
        VectorMetadata {
            codebase_id: codebase.into(),
            file_path: path.into(),
            obfuscated_path: String::new(),
            start_line: 1,
            end_line: 2,
            language: lang.into(),
            chunk_kind: "function".into(),
            name: "f".into(),
            commit: None,
            indexed_at: "2026-01-01T00:00:00Z".into(),
            content_preview: String::new(),
            truncated: false,
        }
    }

    #[test]
    fn renders_pinecone_dialect() {
        let f = Filter::And(vec![
            Filter::codebase("cb"),
            Filter::In(Field::Language, vec!["rust".into(), "go".into()]),
        ]);
        assert_eq!(
            f.to_json(),
            json!({"$and": [
                {"codebase_id": {"$eq": "cb"}},
                {"language": {"$in": ["rust", "go"]}}
            ]})
        );
    }

    #[test]
    fn rejects_degenerate_filters() {
        assert!(Filter::And(vec![]).validate().is_err());
        assert!(Filter::In(Field::FilePath, vec![]).validate().is_err());
        assert!(Filter::codebase("").validate().is_err());
        assert!(Filter::And(vec![Filter::And(vec![])]).validate().is_err());
        assert!(Filter::file("cb", "a.ts").validate().is_ok());
    }

    #[test]
    fn evaluates_against_metadata() {
        let m = meta("cb", "src/a.ts", "typescript");
        assert!(Filter::file("cb", "src/a.ts").matches(&m));
        assert!(!Filter::file("other", "src/a.ts").matches(&m));
        assert!(Filter::In(Field::Language, vec!["rust".into(), "typescript".into()]).matches(&m));
    }
}
