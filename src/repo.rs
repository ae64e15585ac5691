//! Repository sources.
//!
//! The sync engine needs three things from a repository host: a listing of
//! every file at a ref, the bytes of one file, and webhook registration.
//! [`RepositorySource`] is that surface.
//!
//! | Source | Backed by |
//! |--------|-----------|
//! | [`LocalGitRepository`] | `git rev-parse`, `git ls-tree -r -l`, `git cat-file` on a local clone |
//! | [`GitHubRepository`] | GitHub REST: commits, git trees, git blobs, hooks |
//! | [`InMemoryRepository`] | A mutable map, for tests |
//!
//! Listings carry the host's blob id as each file's content hash, so the
//! Merkle tree is built without downloading unchanged files.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use tokio::process::Command;

use codesync_core::merkle::{normalize_path, FileEntry};

use crate::config::{Config, RepositoryConfig};

/// Every file at one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeListing {
    pub commit: Option<String>,
    pub entries: Vec<FileEntry>,
}

#[async_trait]
pub trait RepositorySource: Send + Sync {
    /// List files at `git_ref`, or at the default branch head when `None`.
    async fn list_tree(&self, git_ref: Option<&str>) -> Result<TreeListing>;

    /// Bytes of one listed file.
    async fn get_blob(&self, entry: &FileEntry) -> Result<Vec<u8>>;

    /// Register a push webhook delivering to `url`, signed with `secret`.
    /// Returns the host's hook id.
    async fn register_webhook(&self, url: &str, secret: &str) -> Result<String>;
}

// ============ Path filter ============

const DEFAULT_EXCLUDES: &[&str] = &[
    "**/.git/**",
    "**/node_modules/**",
    "**/target/**",
    "**/dist/**",
    "**/vendor/**",
    "**/*.min.js",
    "**/*.lock",
    "**/package-lock.json",
];

/// Include/exclude globs applied to listings before the tree is built.
#[derive(Debug, Clone)]
pub struct PathFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl PathFilter {
    pub fn new(include_globs: &[String], exclude_globs: &[String]) -> Result<Self> {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(exclude_globs.iter().cloned());
        Ok(Self {
            include: build_globset(include_globs)?,
            exclude: build_globset(&excludes)?,
        })
    }

    /// Everything except the default excludes.
    pub fn allow_all() -> Result<Self> {
        Self::new(&["**/*".to_string()], &[])
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.include.is_match(path) && !self.exclude.is_match(path)
    }

    /// Keep the entries whose normalized path matches.
    pub fn apply(&self, listing: TreeListing) -> TreeListing {
        TreeListing {
            commit: listing.commit,
            entries: listing
                .entries
                .into_iter()
                .filter(|e| self.is_match(&normalize_path(&e.path)))
                .collect(),
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}

// ============ Catalog ============

/// A configured codebase: its source plus sync and webhook settings.
pub struct RepositoryEntry {
    pub id: String,
    pub source: Arc<dyn RepositorySource>,
    pub default_branch: String,
    pub webhook_secret_env: Option<String>,
    pub paths: PathFilter,
}

/// Codebase id → [`RepositoryEntry`].
#[derive(Default, Clone)]
pub struct RepositoryCatalog {
    entries: HashMap<String, Arc<RepositoryEntry>>,
}

impl RepositoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let mut catalog = Self::new();
        for repo in &config.repositories {
            catalog.insert(RepositoryEntry {
                id: repo.id.clone(),
                source: create_source(repo)?,
                default_branch: repo.default_branch.clone(),
                webhook_secret_env: repo.webhook_secret_env.clone(),
                paths: PathFilter::new(&repo.include_globs, &repo.exclude_globs)?,
            });
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, entry: RepositoryEntry) {
        self.entries.insert(entry.id.clone(), Arc::new(entry));
    }

    pub fn get(&self, id: &str) -> Option<Arc<RepositoryEntry>> {
        self.entries.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn create_source(repo: &RepositoryConfig) -> Result<Arc<dyn RepositorySource>> {
    match repo.kind.as_str() {
        "git" => {
            let path = repo
                .path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("repository '{}' requires path", repo.id))?;
            Ok(Arc::new(LocalGitRepository::new(path, &repo.default_branch)))
        }
        "github" => Ok(Arc::new(GitHubRepository::from_config(repo)?)),
        other => bail!("Unknown repository kind: {}", other),
    }
}

// ============ Local git ============

/// A local clone, read through the `git` CLI. Reads objects straight from
/// the object database, so the working tree may be dirty or absent.
pub struct LocalGitRepository {
    path: PathBuf,
    default_branch: String,
}

impl LocalGitRepository {
    pub fn new(path: impl Into<PathBuf>, default_branch: &str) -> Self {
        Self {
            path: path.into(),
            default_branch: default_branch.to_string(),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .await
            .with_context(|| format!("Failed to execute 'git {}'. Is git installed?", args[0]))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args[0], stderr.trim());
        }
        Ok(output.stdout)
    }
}

/// Parse `git ls-tree -r -l -z` output. Submodules and symlinks are skipped.
fn parse_ls_tree(raw: &[u8]) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    for record in raw.split(|b| *b == 0).filter(|r| !r.is_empty()) {
        let record = std::str::from_utf8(record).context("non-UTF-8 path in git ls-tree output")?;
        let (meta, path) = record
            .split_once('\t')
            .ok_or_else(|| anyhow::anyhow!("malformed ls-tree record: {}", record))?;
        let fields: Vec<&str> = meta.split_whitespace().collect();
        if fields.len() != 4 {
            bail!("malformed ls-tree record: {}", record);
        }
        let (mode, kind, object, size) = (fields[0], fields[1], fields[2], fields[3]);
        if kind != "blob" || mode == "120000" {
            continue;
        }
        let size = size.parse::<u64>().unwrap_or(0);
        entries.push(FileEntry::new(path, object, size));
    }
    Ok(entries)
}

#[async_trait]
impl RepositorySource for LocalGitRepository {
    async fn list_tree(&self, git_ref: Option<&str>) -> Result<TreeListing> {
        let target = format!("{}^{{commit}}", git_ref.unwrap_or(&self.default_branch));
        let commit = String::from_utf8_lossy(&self.git(&["rev-parse", "--verify", &target]).await?)
            .trim()
            .to_string();
        let raw = self.git(&["ls-tree", "-r", "-l", "-z", &commit]).await?;
        Ok(TreeListing {
            commit: Some(commit),
            entries: parse_ls_tree(&raw)?,
        })
    }

    async fn get_blob(&self, entry: &FileEntry) -> Result<Vec<u8>> {
        self.git(&["cat-file", "blob", &entry.content_hash])
            .await
            .with_context(|| format!("reading {}", entry.path))
    }

    async fn register_webhook(&self, _url: &str, _secret: &str) -> Result<String> {
        bail!("local git repositories cannot register webhooks")
    }
}

// ============ GitHub ============

/// A repository on GitHub, read through the REST API.
pub struct GitHubRepository {
    client: reqwest::Client,
    api_url: String,
    full_name: String,
    default_branch: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct GitTree {
    #[serde(default)]
    truncated: bool,
    tree: Vec<GitTreeItem>,
}

#[derive(Deserialize)]
struct GitTreeItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    mode: String,
    sha: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Deserialize)]
struct GitBlob {
    content: String,
    encoding: String,
}

#[derive(Deserialize)]
struct CreatedHook {
    id: u64,
}

impl GitHubRepository {
    pub fn from_config(repo: &RepositoryConfig) -> Result<Self> {
        let full_name = repo
            .full_name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("repository '{}' requires full_name", repo.id))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("codesync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_url: repo.api_url.trim_end_matches('/').to_string(),
            full_name,
            default_branch: repo.default_branch.clone(),
            token: std::env::var(&repo.token_env).ok(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.request_as(method, path, "application/vnd.github+json")
    }

    fn request_as(&self, method: reqwest::Method, path: &str, accept: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/repos/{}/{}", self.api_url, self.full_name, path);
        let mut req = self
            .client
            .request(method, url)
            .header("Accept", accept)
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = req
            .send()
            .await
            .with_context(|| format!("GitHub request failed: {}", what))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("GitHub API error {} on {}: {}", status, what, body);
        }
        Ok(response)
    }
}

#[async_trait]
impl RepositorySource for GitHubRepository {
    async fn list_tree(&self, git_ref: Option<&str>) -> Result<TreeListing> {
        let git_ref = git_ref.unwrap_or(&self.default_branch);
        let commit = self
            .send(
                self.request_as(
                    reqwest::Method::GET,
                    &format!("commits/{}", git_ref),
                    "application/vnd.github.sha",
                ),
                "resolve ref",
            )
            .await?
            .text()
            .await?
            .trim()
            .to_string();

        let tree: GitTree = self
            .send(
                self.request(reqwest::Method::GET, &format!("git/trees/{}?recursive=1", commit)),
                "list tree",
            )
            .await?
            .json()
            .await?;
        if tree.truncated {
            tracing::warn!(repo = %self.full_name, "GitHub truncated the tree listing; some files are missing");
        }

        let entries = tree
            .tree
            .into_iter()
            .filter(|item| item.kind == "blob" && item.mode != "120000")
            .map(|item| FileEntry::new(item.path, item.sha, item.size.unwrap_or(0)))
            .collect();

        Ok(TreeListing {
            commit: Some(commit),
            entries,
        })
    }

    async fn get_blob(&self, entry: &FileEntry) -> Result<Vec<u8>> {
        let blob: GitBlob = self
            .send(
                self.request(reqwest::Method::GET, &format!("git/blobs/{}", entry.content_hash)),
                &entry.path,
            )
            .await?
            .json()
            .await?;
        match blob.encoding.as_str() {
            "base64" => {
                let cleaned: String = blob.content.split_whitespace().collect();
                Ok(base64::engine::general_purpose::STANDARD
                    .decode(cleaned)
                    .with_context(|| format!("invalid base64 blob for {}", entry.path))?)
            }
            "utf-8" => Ok(blob.content.into_bytes()),
            other => bail!("unsupported blob encoding '{}' for {}", other, entry.path),
        }
    }

    async fn register_webhook(&self, url: &str, secret: &str) -> Result<String> {
        let body = serde_json::json!({
            "name": "web",
            "active": true,
            "events": ["push"],
            "config": {
                "url": url,
                "content_type": "json",
                "secret": secret,
                "insecure_ssl": "0",
            }
        });
        let hook: CreatedHook = self
            .send(
                self.request(reqwest::Method::POST, "hooks").json(&body),
                "create hook",
            )
            .await?
            .json()
            .await?;
        Ok(hook.id.to_string())
    }
}

// ============ In-memory ============

/// A mutable in-process repository. Every mutation bumps the commit.
#[derive(Default)]
pub struct InMemoryRepository {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    revision: AtomicUsize,
    failing: RwLock<HashSet<String>>,
    hooks: RwLock<Vec<(String, String)>>,
    list_delay: RwLock<Option<Duration>>,
    blob_delay: RwLock<Option<Duration>>,
    blob_reads: AtomicUsize,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files<'a>(files: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let repo = Self::new();
        for (path, content) in files {
            repo.set_file(path, content);
        }
        repo
    }

    pub fn set_file(&self, path: &str, content: &str) {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), content.as_bytes().to_vec());
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    pub fn remove_file(&self, path: &str) {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    /// `get_blob` for `path` fails until [`clear_failures`](Self::clear_failures).
    pub fn fail_blob(&self, path: &str) {
        self.failing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Make `list_tree` take at least `delay`.
    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.write().unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Make every `get_blob` take at least `delay`.
    pub fn set_blob_delay(&self, delay: Duration) {
        *self.blob_delay.write().unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    pub fn blob_reads(&self) -> usize {
        self.blob_reads.load(Ordering::SeqCst)
    }

    /// `(url, secret)` pairs passed to `register_webhook`.
    pub fn registered_hooks(&self) -> Vec<(String, String)> {
        self.hooks.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl RepositorySource for InMemoryRepository {
    async fn list_tree(&self, _git_ref: Option<&str>) -> Result<TreeListing> {
        let delay = *self.list_delay.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        Ok(TreeListing {
            commit: Some(format!("rev-{}", self.revision.load(Ordering::SeqCst))),
            entries: files
                .iter()
                .map(|(path, bytes)| FileEntry::from_bytes(path.clone(), bytes))
                .collect(),
        })
    }

    async fn get_blob(&self, entry: &FileEntry) -> Result<Vec<u8>> {
        self.blob_reads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.blob_delay.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .failing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&entry.path)
        {
            bail!("injected blob failure for {}", entry.path);
        }
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&entry.path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such file: {}", entry.path))
    }

    async fn register_webhook(&self, url: &str, secret: &str) -> Result<String> {
        let mut hooks = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
        hooks.push((url.to_string(), secret.to_string()));
        Ok(format!("hook-{}", hooks.len()))
    }
}
