//! Raw workbook archive, HTTP fetch utilities, and the destination sink for KBRE.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod sink;

pub use sink::{
    upload_stats_in_batches, BatchOutcome, MemorySink, PgSink, Sink, SinkError, UploadSummary,
    STATS_BATCH_SIZE,
};

pub const CRATE_NAME: &str = "kbre-storage";

#[derive(Debug, Clone)]
pub struct ArchivedWorkbook {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Keeps a copy of every downloaded workbook, addressed by fetch day and content hash.
#[derive(Debug, Clone)]
pub struct WorkbookArchive {
    root: PathBuf,
}

impl WorkbookArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn relative_path_for(
        fetched_at: DateTime<Utc>,
        original_filename: &str,
        content_hash: &str,
    ) -> PathBuf {
        let ext = Path::new(original_filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .unwrap_or("bin");
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(format!("{content_hash}.{ext}"))
    }

    /// Writes `bytes` via temp file + rename. An identical workbook already on disk is reused.
    pub async fn store(
        &self,
        fetched_at: DateTime<Utc>,
        original_filename: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedWorkbook> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path_for(fetched_at, original_filename, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedWorkbook {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp archive {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(archived(false))
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    /// `None` keeps the client default (no overall timeout).
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

/// A single GET request. Query values are URL-encoded by the client.
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub query: Vec<(&'a str, String)>,
    pub bearer_token: Option<&'a str>,
}

impl<'a> FetchRequest<'a> {
    pub fn get(url: &'a str) -> Self {
        Self {
            url,
            query: Vec::new(),
            bearer_token: None,
        }
    }

    pub fn query(mut self, key: &'a str, value: impl Into<String>) -> Self {
        self.query.push((key, value.into()));
        self
    }

    pub fn bearer(mut self, token: Option<&'a str>) -> Self {
        self.bearer_token = token;
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Thin wrapper over `reqwest::Client`. Each request is attempted exactly once.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        request: FetchRequest<'_>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url = request.url);
        async {
            let mut builder = self.client.get(request.url).query(&request.query);
            if let Some(token) = request.bearer_token {
                builder = builder.bearer_auth(token);
            }

            let resp = builder.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        source_id: &str,
        request: FetchRequest<'_>,
    ) -> Result<T, FetchError> {
        let fetched = self.fetch_bytes(source_id, request).await?;
        serde_json::from_slice(&fetched.body).map_err(|source| FetchError::Decode {
            url: fetched.final_url,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fetched_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-17T09:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[test]
    fn workbook_hashing_is_stable() {
        let hash = WorkbookArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn archive_path_uses_day_and_original_extension() {
        let path = WorkbookArchive::relative_path_for(fetched_at(), "주간시계열.xlsx", "abc");
        assert_eq!(path, PathBuf::from("20240617").join("abc.xlsx"));

        let path = WorkbookArchive::relative_path_for(fetched_at(), "no-extension", "abc");
        assert_eq!(path, PathBuf::from("20240617").join("abc.bin"));
    }

    #[tokio::test]
    async fn archiving_same_bytes_twice_deduplicates() {
        let dir = tempdir().expect("tempdir");
        let archive = WorkbookArchive::new(dir.path());

        let first = archive
            .store(fetched_at(), "weekly.xlsx", b"PK\x03\x04 workbook")
            .await
            .expect("first store");
        let second = archive
            .store(fetched_at(), "weekly.xlsx", b"PK\x03\x04 workbook")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
        assert_eq!(first.byte_size, 13);
    }

    #[test]
    fn fetch_request_collects_query_pairs() {
        let request = FetchRequest::get("https://example.invalid/reference")
            .query("주월간구분", "0")
            .query("기준년월시작일", "2008-01-01")
            .bearer(Some("token"));
        assert_eq!(request.query.len(), 2);
        assert_eq!(request.query[0], ("주월간구분", "0".to_string()));
        assert_eq!(request.bearer_token, Some("token"));
    }
}
