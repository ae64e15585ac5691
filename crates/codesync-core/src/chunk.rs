//! Code chunker: syntactic units where a grammar exists, line windows otherwise.
//!
//! Splits one file into [`CodeChunk`]s suitable for embedding.
//!
//! # Syntactic mode
//!
//! For Rust, TypeScript/TSX, JavaScript, Python, Go, and Java the file is
//! parsed with tree-sitter and cut along top-level declarations:
//!
//! 1. Functions become `function` chunks; classes, structs, traits, impls,
//!    interfaces, and enums become `class` chunks. Comments and attributes
//!    directly above a declaration are folded into it.
//! 2. Lines between declarations (imports, constants, statements) become
//!    `block` chunks. Gaps holding only blank lines or closing brackets are
//!    dropped.
//! 3. A container longer than `max_chunk_lines` is split into a header
//!    `class` chunk plus one chunk per member; members point at the header
//!    through [`CodeChunk::parent`].
//! 4. Any other unit longer than `max_chunk_lines` is cut into consecutive
//!    parts.
//!
//! Syntactic chunks from one file never share a line.
//!
//! # Window mode
//!
//! Files without a grammar, or whose parse contains errors, are cut into
//! `window_lines`-line windows that overlap by `overlap_lines` so context
//! crossing a boundary is kept in both neighbours.
//!
//! # Identity
//!
//! Chunk ids come from [`chunk_id`] over path, line range, and content hash,
//! so re-chunking unchanged content reproduces the same ids.
//!
//! # Example
//!
//! ```rust
//! use codesync_core::chunk::{Chunker, ChunkerConfig};
//! use codesync_core::models::ChunkKind;
//!
//! let chunker = Chunker::new(ChunkerConfig::default());
//! let chunks = chunker
//!     .chunk("src/lib.rs", b"fn one() {}\n\nfn two() {}\n")
//!     .unwrap();
//! assert_eq!(chunks.len(), 2);
//! assert_eq!(chunks[0].kind, ChunkKind::Function);
//! assert_eq!(chunks[1].name, "two");
//! ```

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tree_sitter::{Node, Parser};

use crate::models::{chunk_id, sha256_hex, ChunkKind, ChunkMetadata, CodeChunk};

/// Tunables for the chunker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Longest syntactic chunk before it is split.
    pub max_chunk_lines: usize,
    /// Window length in fallback mode.
    pub window_lines: usize,
    /// Lines shared by neighbouring windows.
    pub overlap_lines: usize,
    /// Files larger than this are refused.
    pub max_file_bytes: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_lines: 150,
            window_lines: 60,
            overlap_lines: 10,
            max_file_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("binary content")]
    Binary,
    #[error("file is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
}

/// Language name for a path, by extension. Unknown extensions map to `"text"`.
pub fn detect_language(path: &str) -> &'static str {
    let file = path.rsplit('/').next().unwrap_or(path);
    let ext = file.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("rs") => "rust",
        Some("ts") | Some("mts") | Some("cts") => "typescript",
        Some("tsx") => "tsx",
        Some("js") | Some("mjs") | Some("cjs") | Some("jsx") => "javascript",
        Some("py") | Some("pyi") => "python",
        Some("go") => "go",
        Some("java") => "java",
        Some("md") | Some("mdx") => "markdown",
        Some("json") => "json",
        Some("yml") | Some("yaml") => "yaml",
        Some("toml") => "toml",
        Some("c") | Some("h") => "c",
        Some("cc") | Some("cpp") | Some("hpp") | Some("cxx") => "cpp",
        Some("rb") => "ruby",
        Some("sh") | Some("bash") => "shell",
        Some("sql") => "sql",
        _ => "text",
    }
}

fn grammar(language: &str) -> Option<tree_sitter::Language> {
    match language {
        "rust" => Some(tree_sitter_rust::LANGUAGE.into()),
        "typescript" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        "tsx" => Some(tree_sitter_typescript::LANGUAGE_TSX.into()),
        "javascript" => Some(tree_sitter_javascript::LANGUAGE.into()),
        "python" => Some(tree_sitter_python::LANGUAGE.into()),
        "go" => Some(tree_sitter_go::LANGUAGE.into()),
        "java" => Some(tree_sitter_java::LANGUAGE.into()),
        _ => None,
    }
}

/// Splits files into [`CodeChunk`]s.
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkerConfig,
}

struct FileCtx<'a> {
    path: &'a str,
    language: &'static str,
    lines: Vec<&'a str>,
    source: &'a str,
}

struct Unit<'t> {
    start: usize,
    end: usize,
    kind: ChunkKind,
    name: String,
    decl: Node<'t>,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunk raw file bytes. Empty or whitespace-only files yield no chunks.
    pub fn chunk(&self, path: &str, bytes: &[u8]) -> Result<Vec<CodeChunk>, ChunkError> {
        if bytes.len() > self.config.max_file_bytes {
            return Err(ChunkError::TooLarge {
                size: bytes.len(),
                limit: self.config.max_file_bytes,
            });
        }
        if bytes.iter().take(8192).any(|b| *b == 0) {
            return Err(ChunkError::Binary);
        }
        let text = std::str::from_utf8(bytes).map_err(|_| ChunkError::Binary)?;
        Ok(self.chunk_text(path, text))
    }

    /// Chunk decoded text.
    pub fn chunk_text(&self, path: &str, text: &str) -> Vec<CodeChunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        let ctx = FileCtx {
            path,
            language: detect_language(path),
            lines: text.lines().collect(),
            source: text,
        };

        if let Some(chunks) = self.chunk_syntactic(&ctx) {
            return chunks;
        }
        self.chunk_windows(&ctx)
    }

    fn chunk_syntactic(&self, ctx: &FileCtx<'_>) -> Option<Vec<CodeChunk>> {
        let lang = grammar(ctx.language)?;
        let mut parser = Parser::new();
        parser.set_language(&lang).ok()?;
        let tree = parser.parse(ctx.source, None)?;
        let root = tree.root_node();
        if root.has_error() {
            tracing::debug!(path = ctx.path, "parse errors, falling back to windows");
            return None;
        }

        let units = collect_units(ctx, root, false);
        let mut out = Vec::new();
        self.layout(ctx, units, (1, ctx.lines.len()), None, &mut out);
        Some(out)
    }

    fn layout(
        &self,
        ctx: &FileCtx<'_>,
        units: Vec<Unit<'_>>,
        region: (usize, usize),
        parent: Option<&str>,
        out: &mut Vec<CodeChunk>,
    ) {
        let (region_start, region_end) = region;
        let mut cursor = region_start;
        for unit in units {
            let start = unit.start.max(cursor);
            let end = unit.end.min(region_end);
            if start > end {
                continue;
            }
            self.emit_gap(ctx, cursor, start - 1, parent, out);
            self.emit_unit(ctx, &unit, start, end, parent, out);
            cursor = end + 1;
        }
        self.emit_gap(ctx, cursor, region_end, parent, out);
    }

    fn emit_unit(
        &self,
        ctx: &FileCtx<'_>,
        unit: &Unit<'_>,
        start: usize,
        end: usize,
        parent: Option<&str>,
        out: &mut Vec<CodeChunk>,
    ) {
        let max = self.config.max_chunk_lines.max(1);
        if end - start < max {
            out.push(make_chunk(ctx, start, end, unit.kind, &unit.name, parent));
            return;
        }

        if unit.kind == ChunkKind::Class {
            let members: Vec<Unit<'_>> = unit
                .decl
                .child_by_field_name("body")
                .map(|body| collect_units(ctx, body, true))
                .unwrap_or_default()
                .into_iter()
                .filter(|m| m.start > start && m.start <= end)
                .collect();

            if let Some(first) = members.first() {
                let header_end = first.start - 1;
                let header = self.split_range(ctx, start, header_end, unit.kind, &unit.name, parent);
                let header_id = header[0].id.clone();
                out.extend(header);
                self.layout(ctx, members, (header_end + 1, end), Some(&header_id), out);
                return;
            }
        }

        out.extend(self.split_range(ctx, start, end, unit.kind, &unit.name, parent));
    }

    fn emit_gap(
        &self,
        ctx: &FileCtx<'_>,
        start: usize,
        end: usize,
        parent: Option<&str>,
        out: &mut Vec<CodeChunk>,
    ) {
        if start > end {
            return;
        }
        let mut s = start;
        let mut e = end;
        while s <= e && ctx.lines[s - 1].trim().is_empty() {
            s += 1;
        }
        while e >= s && ctx.lines[e - 1].trim().is_empty() {
            e -= 1;
        }
        if s > e || !ctx.lines[s - 1..e].iter().any(|l| is_meaningful(l)) {
            return;
        }
        let name = format!("L{}-L{}", s, e);
        out.extend(self.split_range(ctx, s, e, ChunkKind::Block, &name, parent));
    }

    /// Cut `[start, end]` into consecutive non-overlapping pieces of at most
    /// `max_chunk_lines` lines.
    fn split_range(
        &self,
        ctx: &FileCtx<'_>,
        start: usize,
        end: usize,
        kind: ChunkKind,
        name: &str,
        parent: Option<&str>,
    ) -> Vec<CodeChunk> {
        let max = self.config.max_chunk_lines.max(1);
        let total = (end - start) / max + 1;
        if total == 1 {
            return vec![make_chunk(ctx, start, end, kind, name, parent)];
        }
        (0..total)
            .map(|i| {
                let s = start + i * max;
                let e = (s + max - 1).min(end);
                let part_name = format!("{} (part {}/{})", name, i + 1, total);
                make_chunk(ctx, s, e, kind, &part_name, parent)
            })
            .collect()
    }

    fn chunk_windows(&self, ctx: &FileCtx<'_>) -> Vec<CodeChunk> {
        let n = ctx.lines.len();
        let window = self.config.window_lines.max(1);
        let step = window.saturating_sub(self.config.overlap_lines).max(1);
        let file_name = ctx.path.rsplit('/').next().unwrap_or(ctx.path);

        let mut out = Vec::new();
        let mut start = 1;
        while start <= n {
            let end = (start + window - 1).min(n);
            if ctx.lines[start - 1..end].iter().any(|l| !l.trim().is_empty()) {
                let name = format!("{}:{}-{}", file_name, start, end);
                out.push(make_chunk(ctx, start, end, ChunkKind::Window, &name, None));
            }
            if end == n {
                break;
            }
            start += step;
        }
        out
    }
}

fn make_chunk(
    ctx: &FileCtx<'_>,
    start: usize,
    end: usize,
    kind: ChunkKind,
    name: &str,
    parent: Option<&str>,
) -> CodeChunk {
    let content = ctx.lines[start - 1..end].join("\n");
    let content_hash = sha256_hex(content.as_bytes());
    CodeChunk {
        id: chunk_id(ctx.path, start, end, &content_hash),
        file_path: ctx.path.to_string(),
        kind,
        name: name.to_string(),
        start_line: start,
        end_line: end,
        metadata: extract_metadata(&content, ctx.language),
        content,
        content_hash,
        parent: parent.map(str::to_string),
    }
}

/// True when a line carries more than whitespace or closing punctuation.
fn is_meaningful(line: &str) -> bool {
    line.trim()
        .chars()
        .any(|c| !matches!(c, '}' | ')' | ']' | ';' | ','))
}

fn line_span(node: Node<'_>) -> (usize, usize) {
    let start = node.start_position().row;
    let end_pos = node.end_position();
    let end = if end_pos.column == 0 && end_pos.row > start {
        end_pos.row - 1
    } else {
        end_pos.row
    };
    (start + 1, end + 1)
}

fn is_leading_trivia(kind: &str) -> bool {
    kind.contains("comment") || kind == "attribute_item" || kind == "decorator"
}

fn collect_units<'t>(ctx: &FileCtx<'_>, parent: Node<'t>, members: bool) -> Vec<Unit<'t>> {
    let mut cursor = parent.walk();
    let children: Vec<Node<'t>> = parent.named_children(&mut cursor).collect();

    let mut units = Vec::new();
    let mut trivia_start: Option<usize> = None;
    let mut trivia_end = 0usize;

    for child in children {
        let (start, end) = line_span(child);
        if is_leading_trivia(child.kind()) {
            if trivia_start.is_none() || start > trivia_end + 1 {
                trivia_start = Some(start);
            }
            trivia_end = end;
            continue;
        }

        let classified = if members {
            classify_member(child, ctx)
        } else {
            classify(child, ctx)
        };

        if let Some((kind, name, decl)) = classified {
            let start = match trivia_start {
                Some(ts) if trivia_end + 1 >= start => ts,
                _ => start,
            };
            units.push(Unit {
                start,
                end,
                kind,
                name,
                decl,
            });
        }
        trivia_start = None;
    }
    units
}

fn node_text<'s>(node: Node<'_>, ctx: &FileCtx<'s>) -> &'s str {
    node.utf8_text(ctx.source.as_bytes()).unwrap_or("")
}

fn field_text(node: Node<'_>, field: &str, ctx: &FileCtx<'_>) -> Option<String> {
    node.child_by_field_name(field)
        .map(|n| node_text(n, ctx).to_string())
        .filter(|s| !s.is_empty())
}

fn named(node: Node<'_>, ctx: &FileCtx<'_>) -> String {
    field_text(node, "name", ctx).unwrap_or_else(|| "anonymous".to_string())
}

fn classify<'t>(node: Node<'t>, ctx: &FileCtx<'_>) -> Option<(ChunkKind, String, Node<'t>)> {
    let kind = node.kind();
    match ctx.language {
        "rust" => match kind {
            "function_item" | "function_signature_item" | "macro_definition" => {
                Some((ChunkKind::Function, named(node, ctx), node))
            }
            "struct_item" | "enum_item" | "union_item" | "trait_item" => {
                Some((ChunkKind::Class, named(node, ctx), node))
            }
            "mod_item" if node.child_by_field_name("body").is_some() => {
                Some((ChunkKind::Class, named(node, ctx), node))
            }
            "impl_item" => {
                let ty = field_text(node, "type", ctx).unwrap_or_default();
                let name = match field_text(node, "trait", ctx) {
                    Some(tr) => format!("impl {} for {}", tr, ty),
                    None => format!("impl {}", ty),
                };
                Some((ChunkKind::Class, name, node))
            }
            _ => None,
        },
        "typescript" | "tsx" | "javascript" => match kind {
            "function_declaration" | "generator_function_declaration" => {
                Some((ChunkKind::Function, named(node, ctx), node))
            }
            "class_declaration"
            | "abstract_class_declaration"
            | "interface_declaration"
            | "enum_declaration" => Some((ChunkKind::Class, named(node, ctx), node)),
            "export_statement" => {
                let decl = node.child_by_field_name("declaration")?;
                classify(decl, ctx)
            }
            "lexical_declaration" | "variable_declaration" => {
                let mut cursor = node.walk();
                let declarators: Vec<Node<'t>> = node.named_children(&mut cursor).collect();
                declarators.into_iter().find_map(|d| {
                    let value = d.child_by_field_name("value")?;
                    match value.kind() {
                        "arrow_function" | "function_expression" | "function" => {
                            Some((ChunkKind::Function, named(d, ctx), node))
                        }
                        "class" => Some((ChunkKind::Class, named(d, ctx), value)),
                        _ => None,
                    }
                })
            }
            _ => None,
        },
        "python" => match kind {
            "function_definition" => Some((ChunkKind::Function, named(node, ctx), node)),
            "class_definition" => Some((ChunkKind::Class, named(node, ctx), node)),
            "decorated_definition" => {
                let def = node.child_by_field_name("definition")?;
                classify(def, ctx)
            }
            _ => None,
        },
        "go" => match kind {
            "function_declaration" | "method_declaration" => {
                Some((ChunkKind::Function, named(node, ctx), node))
            }
            "type_declaration" => {
                let mut cursor = node.walk();
                let spec = node
                    .named_children(&mut cursor)
                    .find(|c| c.kind() == "type_spec");
                let name = spec.map(|s| named(s, ctx)).unwrap_or_else(|| "type".to_string());
                Some((ChunkKind::Class, name, node))
            }
            _ => None,
        },
        "java" => match kind {
            "class_declaration"
            | "interface_declaration"
            | "enum_declaration"
            | "record_declaration" => Some((ChunkKind::Class, named(node, ctx), node)),
            "method_declaration" | "constructor_declaration" => {
                Some((ChunkKind::Function, named(node, ctx), node))
            }
            _ => None,
        },
        _ => None,
    }
}

fn classify_member<'t>(node: Node<'t>, ctx: &FileCtx<'_>) -> Option<(ChunkKind, String, Node<'t>)> {
    match node.kind() {
        "function_item"
        | "function_signature_item"
        | "method_definition"
        | "method_signature"
        | "abstract_method_signature"
        | "function_definition"
        | "method_declaration"
        | "constructor_declaration" => Some((ChunkKind::Function, named(node, ctx), node)),
        "decorated_definition" => {
            let def = node.child_by_field_name("definition")?;
            Some((ChunkKind::Function, named(def, ctx), node))
        }
        _ => None,
    }
}

// ─── Metadata ───────────────────────────────────────────────────────

static BRANCH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:if|for|while|case|catch|match|elif|except|when)\b|&&|\|\|").expect("valid regex")
});

static IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]{2,}").expect("valid regex"));

static JS_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*import\b.*?(?:from\s+)?['"]([^'"]+)['"]"#).expect("valid regex")
});
static JS_REQUIRE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"require\(\s*['"]([^'"]+)['"]\s*\)"#).expect("valid regex"));
static JS_EXPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*export\s+(?:default\s+)?(?:declare\s+)?(?:abstract\s+)?(?:async\s+)?(?:function\*?|class|const|let|var|interface|type|enum)\s+([A-Za-z_$][\w$]*)",
    )
    .expect("valid regex")
});
static PY_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:from\s+([\w\.]+)\s+import\b|import\s+([\w\.]+))").expect("valid regex")
});
static PY_EXPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:async\s+)?(?:def|class)\s+([A-Za-z]\w*)").expect("valid regex"));
static RS_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:use\s+([\w:]+)|extern\s+crate\s+(\w+))")
        .expect("valid regex")
});
static RS_EXPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*pub(?:\([^)]*\))?\s+(?:async\s+)?(?:unsafe\s+)?(?:fn|struct|enum|trait|type|const|static|mod|union)\s+(\w+)",
    )
    .expect("valid regex")
});
static GO_IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\s*(?:import\s+)?(?:\w+\s+)?"([\w\./\-]+)"\s*$"#).expect("valid regex"));
static GO_EXPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:func\s+(?:\([^)]*\)\s*)?|type\s+)([A-Z]\w*)").expect("valid regex")
});
static JAVA_IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*import\s+(?:static\s+)?([\w\.\*]+)\s*;").expect("valid regex"));
static JAVA_EXPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*public\s+(?:static\s+)?(?:final\s+)?(?:abstract\s+)?(?:class|interface|enum|record)\s+(\w+)",
    )
    .expect("valid regex")
});

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "let", "const", "var", "function", "return", "class", "import", "export",
    "from", "pub", "use", "impl", "self", "Self", "this", "def", "elif", "else", "while", "match",
    "true", "false", "null", "None", "True", "False", "new", "mut", "async", "await", "static",
    "struct", "enum", "trait", "type", "interface", "public", "private", "protected", "void",
    "int", "string", "String", "str", "func", "package", "default", "case", "break", "continue",
    "try", "catch", "throw", "throws", "final", "undefined", "typeof", "instanceof", "extends",
    "implements", "where", "with", "yield", "lambda", "pass", "crate", "super", "mod", "Some",
    "Ok", "Err", "Vec", "Option", "Result", "bool", "usize", "u32", "u64", "i32", "i64", "f32",
    "f64", "not", "is", "in", "as", "if", "fn", "go", "defer", "chan", "map", "range",
];

const MAX_KEYWORDS: usize = 10;

/// Extract language, complexity, keywords, imports, exports, and
/// dependencies from chunk text.
pub fn extract_metadata(content: &str, language: &str) -> ChunkMetadata {
    let mut imports = Vec::new();
    let mut dependencies = Vec::new();
    let mut exports = Vec::new();

    let (import_res, export_re): (Vec<&Regex>, Option<&Regex>) = match language {
        "typescript" | "tsx" | "javascript" => (vec![&*JS_IMPORT_RE, &*JS_REQUIRE_RE], Some(&*JS_EXPORT_RE)),
        "python" => (vec![&*PY_IMPORT_RE], Some(&*PY_EXPORT_RE)),
        "rust" => (vec![&*RS_IMPORT_RE], Some(&*RS_EXPORT_RE)),
        "go" => (vec![&*GO_IMPORT_RE], Some(&*GO_EXPORT_RE)),
        "java" => (vec![&*JAVA_IMPORT_RE], Some(&*JAVA_EXPORT_RE)),
        _ => (Vec::new(), None),
    };

    for line in content.lines() {
        for re in &import_res {
            if let Some(caps) = re.captures(line) {
                let spec = caps
                    .iter()
                    .skip(1)
                    .flatten()
                    .next()
                    .map(|m| m.as_str().to_string());
                push_unique(&mut imports, line.trim().to_string());
                if let Some(spec) = spec {
                    push_unique(&mut dependencies, spec);
                }
                break;
            }
        }
        if let Some(re) = export_re {
            if let Some(name) = re.captures(line).and_then(|c| c.get(1)) {
                let name = name.as_str();
                if language != "python" || !name.starts_with('_') {
                    push_unique(&mut exports, name.to_string());
                }
            }
        }
    }

    ChunkMetadata {
        language: language.to_string(),
        complexity: 1 + BRANCH_RE.find_iter(content).count() as u32,
        keywords: top_keywords(content),
        imports,
        exports,
        dependencies,
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

fn top_keywords(content: &str) -> Vec<String> {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (order, m) in IDENT_RE.find_iter(content).enumerate() {
        let word = m.as_str();
        if STOPWORDS.contains(&word) {
            continue;
        }
        counts.entry(word).or_insert((0, order)).0 += 1;
    }
    let mut ranked: Vec<(&str, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    ranked
        .into_iter()
        .take(MAX_KEYWORDS)
        .map(|(w, _)| w.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> Chunker {
        Chunker::new(ChunkerConfig::default())
    }

    fn assert_no_overlap(chunks: &[CodeChunk]) {
        let mut sorted: Vec<&CodeChunk> = chunks.iter().collect();
        sorted.sort_by_key(|c| c.start_line);
        for pair in sorted.windows(2) {
            assert!(
                pair[0].end_line < pair[1].start_line,
                "{}..{} overlaps {}..{}",
                pair[0].start_line,
                pair[0].end_line,
                pair[1].start_line,
                pair[1].end_line
            );
        }
        for c in chunks {
            assert!(c.start_line <= c.end_line);
        }
    }

    const TS_SOURCE: &str = r#"import { readFile } from "fs";
import path from "path";

// Adds numbers.
export function add(a: number, b: number): number {
  if (a > 0 && b > 0) {
    return a + b;
  }
  return 0;
}

export class Greeter {
  greet(name: string): string {
    return `hi ${name}`;
  }
}

const helper = (x: number) => x * 2;

console.log(add(1, 2));
"#;

    #[test]
    fn typescript_units_and_blocks() {
        let chunks = chunker().chunk_text("src/math.ts", TS_SOURCE);
        let names: Vec<(&str, ChunkKind)> =
            chunks.iter().map(|c| (c.name.as_str(), c.kind)).collect();

        assert!(names.contains(&("add", ChunkKind::Function)));
        assert!(names.contains(&("Greeter", ChunkKind::Class)));
        assert!(names.contains(&("helper", ChunkKind::Function)));
        assert!(chunks.iter().any(|c| c.kind == ChunkKind::Block && c.content.contains("import")));
        assert_no_overlap(&chunks);

        let add = chunks.iter().find(|c| c.name == "add").unwrap();
        assert!(add.content.starts_with("// Adds numbers."), "leading comment folded in");
        assert_eq!(add.metadata.language, "typescript");
        assert!(add.metadata.complexity >= 3);
        assert_eq!(add.metadata.exports, vec!["add"]);

        let imports = chunks.iter().find(|c| c.start_line == 1).unwrap();
        assert_eq!(imports.metadata.dependencies, vec!["fs", "path"]);
    }

    #[test]
    fn ids_are_stable_across_runs() {
        let a = chunker().chunk_text("src/math.ts", TS_SOURCE);
        let b = chunker().chunk_text("src/math.ts", TS_SOURCE);
        assert_eq!(
            a.iter().map(|c| &c.id).collect::<Vec<_>>(),
            b.iter().map(|c| &c.id).collect::<Vec<_>>()
        );
        let moved = chunker().chunk_text("src/other.ts", TS_SOURCE);
        assert_ne!(a[0].id, moved[0].id);
    }

    #[test]
    fn unchanged_function_keeps_its_id_when_a_later_one_changes() {
        let v1 = "fn a() {\n    1\n}\n\nfn b() {\n    2\n}\n";
        let v2 = "fn a() {\n    1\n}\n\nfn b() {\n    3\n}\n";
        let c1 = chunker().chunk_text("lib.rs", v1);
        let c2 = chunker().chunk_text("lib.rs", v2);
        assert_eq!(c1[0].id, c2[0].id);
        assert_ne!(c1[1].id, c2[1].id);
    }

    #[test]
    fn rust_items_and_impl_names() {
        let src = "use std::fmt;\n\n/// A point.\n#[derive(Debug)]\npub struct Point {\n    x: i32,\n}\n\nimpl fmt::Display for Point {\n    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {\n        write!(f, \"{}\", self.x)\n    }\n}\n";
        let chunks = chunker().chunk_text("src/point.rs", src);
        assert_no_overlap(&chunks);
        let point = chunks.iter().find(|c| c.name == "Point").unwrap();
        assert_eq!(point.kind, ChunkKind::Class);
        assert_eq!(point.start_line, 3, "doc comment and attribute included");
        assert!(chunks.iter().any(|c| c.name == "impl fmt::Display for Point"));
        assert_eq!(chunks[0].metadata.dependencies, vec!["std::fmt"]);
    }

    #[test]
    fn large_container_is_split_with_parent_links() {
        let mut src = String::from("class Big:\n    \"\"\"Docs.\"\"\"\n\n");
        for i in 0..6 {
            src.push_str(&format!("    def m{}(self):\n", i));
            for j in 0..5 {
                src.push_str(&format!("        x{} = {}\n", j, j));
            }
            src.push('\n');
        }
        let chunker = Chunker::new(ChunkerConfig {
            max_chunk_lines: 10,
            ..ChunkerConfig::default()
        });
        let chunks = chunker.chunk_text("big.py", &src);
        assert_no_overlap(&chunks);

        let header = chunks.iter().find(|c| c.name == "Big").unwrap();
        assert_eq!(header.kind, ChunkKind::Class);
        assert!(header.parent.is_none());
        let methods: Vec<&CodeChunk> =
            chunks.iter().filter(|c| c.kind == ChunkKind::Function).collect();
        assert_eq!(methods.len(), 6);
        assert!(methods.iter().all(|m| m.parent.as_deref() == Some(header.id.as_str())));
    }

    #[test]
    fn oversized_function_is_cut_into_parts() {
        let mut src = String::from("fn long() {\n");
        for i in 0..25 {
            src.push_str(&format!("    let v{} = {};\n", i, i));
        }
        src.push_str("}\n");
        let chunker = Chunker::new(ChunkerConfig {
            max_chunk_lines: 10,
            ..ChunkerConfig::default()
        });
        let chunks = chunker.chunk_text("long.rs", &src);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].name, "long (part 1/3)");
        assert_no_overlap(&chunks);
        assert_eq!(chunks.last().unwrap().end_line, 27);
    }

    #[test]
    fn unknown_language_uses_overlapping_windows() {
        let text = (1..=130).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        let chunks = chunker().chunk_text("notes.txt", &text);
        assert!(chunks.iter().all(|c| c.kind == ChunkKind::Window));
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 60);
        assert_eq!(chunks[1].start_line, 51, "windows overlap by 10 lines");
        assert_eq!(chunks.last().unwrap().end_line, 130);
    }

    #[test]
    fn parse_errors_fall_back_to_windows() {
        let chunks = chunker().chunk_text("broken.ts", "function (((( {\n  nope\n");
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.kind == ChunkKind::Window));
    }

    #[test]
    fn empty_binary_and_oversized_inputs() {
        assert!(chunker().chunk("empty.ts", b"").unwrap().is_empty());
        assert!(chunker().chunk("blank.ts", b"\n\n  \n").unwrap().is_empty());
        assert_eq!(chunker().chunk("img.png", &[0x89, 0x50, 0, 1]), Err(ChunkError::Binary));
        assert_eq!(chunker().chunk("bad.txt", &[0xff, 0xfe, 0xfd]), Err(ChunkError::Binary));

        let small = Chunker::new(ChunkerConfig {
            max_file_bytes: 4,
            ..ChunkerConfig::default()
        });
        assert!(matches!(small.chunk("a.ts", b"12345"), Err(ChunkError::TooLarge { .. })));
    }

    #[test]
    fn detects_languages() {
        assert_eq!(detect_language("a/b/c.rs"), "rust");
        assert_eq!(detect_language("x.TSX"), "tsx");
        assert_eq!(detect_language("Makefile"), "text");
        assert_eq!(detect_language("pkg/main.go"), "go");
    }

    #[test]
    fn keywords_rank_by_frequency() {
        let meta = extract_metadata("token token token parser parser lexer", "text");
        assert_eq!(meta.keywords, vec!["token", "parser", "lexer"]);
        assert_eq!(meta.complexity, 1);
    }
}
