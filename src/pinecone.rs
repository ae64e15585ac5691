//! Pinecone-compatible HTTP vector database.
//!
//! Control plane (`{control_url}/indexes`) for create/describe/delete;
//! data plane (`https://{host}`) for upsert, delete and query. The data
//! plane host comes from `describe_index` and is cached until the index is
//! deleted. Authenticates with the `Api-Key` header.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use codesync_core::filter::Filter;
use codesync_core::models::{VectorMatch, VectorRecord};
use codesync_core::store::{IndexDescription, VectorDatabase};

use crate::config::IndexConfig;

const API_VERSION: &str = "2024-07";

pub struct PineconeDatabase {
    client: reqwest::Client,
    control_url: String,
    api_key: String,
    name: String,
    metric: String,
    cloud: String,
    region: String,
    host: RwLock<Option<String>>,
}

#[derive(Deserialize)]
struct DescribeResponse {
    name: String,
    dimension: usize,
    host: String,
    #[serde(default)]
    status: IndexStatus,
}

#[derive(Deserialize, Default)]
struct IndexStatus {
    #[serde(default)]
    ready: bool,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<RawMatch>,
}

#[derive(Deserialize)]
struct RawMatch {
    id: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

impl PineconeDatabase {
    pub fn from_config(config: &IndexConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .with_context(|| format!("{} environment variable not set", config.api_key_env))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            control_url: config.control_url.trim_end_matches('/').to_string(),
            api_key,
            name: config.name.clone(),
            metric: config.metric.clone(),
            cloud: config.cloud.clone(),
            region: config.region.clone(),
            host: RwLock::new(None),
        })
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        bail!("Pinecone {} failed with {}: {}", what, status, body)
    }

    fn cached_host(&self) -> Option<String> {
        self.host.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn data_url(&self, path: &str) -> Result<String> {
        let host = match self.cached_host() {
            Some(h) => h,
            None => {
                if self.describe_index().await?.is_none() {
                    bail!("index '{}' does not exist", self.name);
                }
                self.cached_host()
                    .ok_or_else(|| anyhow::anyhow!("index '{}' has no host", self.name))?
            }
        };
        if host.starts_with("http://") || host.starts_with("https://") {
            Ok(format!("{}{}", host.trim_end_matches('/'), path))
        } else {
            Ok(format!("https://{}{}", host, path))
        }
    }
}

#[async_trait]
impl VectorDatabase for PineconeDatabase {
    async fn describe_index(&self) -> Result<Option<IndexDescription>> {
        let response = self
            .request(
                reqwest::Method::GET,
                format!("{}/indexes/{}", self.control_url, self.name),
            )
            .send()
            .await
            .context("Pinecone describe_index request failed")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            *self.host.write().unwrap_or_else(PoisonError::into_inner) = None;
            return Ok(None);
        }
        let desc: DescribeResponse = Self::check(response, "describe_index").await?.json().await?;
        *self.host.write().unwrap_or_else(PoisonError::into_inner) = Some(desc.host);
        Ok(Some(IndexDescription {
            name: desc.name,
            dimension: desc.dimension,
            ready: desc.status.ready,
        }))
    }

    async fn create_index(&self, dimension: usize) -> Result<()> {
        let body = serde_json::json!({
            "name": self.name,
            "dimension": dimension,
            "metric": self.metric,
            "spec": { "serverless": { "cloud": self.cloud, "region": self.region } },
        });
        let response = self
            .request(reqwest::Method::POST, format!("{}/indexes", self.control_url))
            .json(&body)
            .send()
            .await
            .context("Pinecone create_index request failed")?;
        Self::check(response, "create_index").await?;
        Ok(())
    }

    async fn delete_index(&self) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                format!("{}/indexes/{}", self.control_url, self.name),
            )
            .send()
            .await
            .context("Pinecone delete_index request failed")?;
        *self.host.write().unwrap_or_else(PoisonError::into_inner) = None;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response, "delete_index").await?;
        Ok(())
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let vectors: Vec<serde_json::Value> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.id,
                    "values": r.values,
                    "metadata": r.metadata,
                })
            })
            .collect();
        let url = self.data_url("/vectors/upsert").await?;
        let response = self
            .request(reqwest::Method::POST, url)
            .json(&serde_json::json!({ "vectors": vectors }))
            .send()
            .await
            .context("Pinecone upsert request failed")?;
        Self::check(response, "upsert").await?;
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let url = self.data_url("/vectors/delete").await?;
        let response = self
            .request(reqwest::Method::POST, url)
            .json(&serde_json::json!({ "ids": ids }))
            .send()
            .await
            .context("Pinecone delete request failed")?;
        Self::check(response, "delete").await?;
        Ok(())
    }

    async fn query(&self, vector: &[f32], filter: &Filter, top_k: usize) -> Result<Vec<VectorMatch>> {
        let body = serde_json::json!({
            "vector": vector,
            "topK": top_k,
            "filter": filter.to_json(),
            "includeMetadata": true,
            "includeValues": false,
        });
        let url = self.data_url("/query").await?;
        let response = self
            .request(reqwest::Method::POST, url)
            .json(&body)
            .send()
            .await
            .context("Pinecone query request failed")?;
        let parsed: QueryResponse = Self::check(response, "query").await?.json().await?;
        Ok(parsed
            .matches
            .into_iter()
            .map(|m| VectorMatch {
                id: m.id,
                score: m.score,
                // Numeric metadata may come back as floats; ids are what matter here.
                metadata: m.metadata.and_then(|v| serde_json::from_value(v).ok()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_describe_and_query_bodies() {
        let desc: DescribeResponse = serde_json::from_str(
            r#"{"name":"codesync","dimension":1536,"host":"codesync-abc.svc.pinecone.io","status":{"ready":true,"state":"Ready"}}"#,
        )
        .unwrap();
        assert_eq!(desc.dimension, 1536);
        assert!(desc.status.ready);

        let q: QueryResponse =
            serde_json::from_str(r#"{"matches":[{"id":"a","score":0.5}],"namespace":""}"#).unwrap();
        assert_eq!(q.matches.len(), 1);
        assert!(q.matches[0].metadata.is_none());
    }
}
