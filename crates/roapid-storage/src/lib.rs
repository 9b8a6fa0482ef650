//! Artifact persistence, change detection and HTTP fetch utilities for roapid.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use roapid_core::LAST_UPDATED_FIELD;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roapid-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("payload for {} is not a JSON object", .0.display())]
    NotAnObject(PathBuf),
    #[error("serializing payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StorageError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    /// Bytes as written, including the injected timestamp.
    pub bytes: Vec<u8>,
}

/// Last-written payload per job, one JSON file per relative path.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
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

    pub async fn read_existing(
        &self,
        relative_path: impl AsRef<Path>,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.root.join(relative_path);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::io("reading artifact", &path, err)),
        }
    }

    /// True unless the stored artifact matches `new_payload` apart from the timestamp field.
    pub async fn has_changed(
        &self,
        relative_path: impl AsRef<Path>,
        new_payload: &[u8],
    ) -> Result<bool, StorageError> {
        match self.read_existing(relative_path).await? {
            None => Ok(true),
            Some(old) => payload_changed(&old, new_payload),
        }
    }

    /// Inject `lastUpdated`, then write pretty JSON via an atomic temp-file rename.
    pub async fn save(
        &self,
        relative_path: impl AsRef<Path>,
        raw: &[u8],
    ) -> Result<StoredArtifact, StorageError> {
        let relative_path = relative_path.as_ref().to_path_buf();
        let absolute_path = self.root.join(&relative_path);

        let mut object: Map<String, Value> = serde_json::from_slice(raw)
            .map_err(|_| StorageError::NotAnObject(relative_path.clone()))?;
        object.insert(
            LAST_UPDATED_FIELD.to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        let bytes = serde_json::to_vec_pretty(&canonicalize(Value::Object(object)))?;

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| StorageError::io("creating artifact directory", &parent, e))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StorageError::io("opening temp artifact file", &temp_path, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| StorageError::io("writing temp artifact file", &temp_path, e))?;
        file.flush()
            .await
            .map_err(|e| StorageError::io("flushing temp artifact file", &temp_path, e))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::io("renaming temp artifact", &absolute_path, err));
        }

        debug!(path = %relative_path.display(), size = bytes.len(), "artifact saved");
        Ok(StoredArtifact {
            content_hash: Self::sha256_hex(&bytes),
            relative_path,
            absolute_path,
            bytes,
        })
    }

    /// Names of regular files directly under the root. `None` when the root does not exist yet.
    pub async fn list_file_names(&self) -> Result<Option<Vec<String>>, StorageError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageError::io("reading artifact directory", &self.root, err)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io("reading artifact directory", &self.root, e))?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|ft| ft.is_file())
                .unwrap_or(false);
            if is_file {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(Some(names))
    }
}

/// Structural comparison ignoring `lastUpdated`; falls back to raw byte equality
/// when either side is not a JSON object.
pub fn payload_changed(old: &[u8], new: &[u8]) -> Result<bool, StorageError> {
    let parsed_old = serde_json::from_slice::<Map<String, Value>>(old);
    let parsed_new = serde_json::from_slice::<Map<String, Value>>(new);
    let (Ok(mut old_object), Ok(mut new_object)) = (parsed_old, parsed_new) else {
        return Ok(old != new);
    };

    old_object.remove(LAST_UPDATED_FIELD);
    new_object.remove(LAST_UPDATED_FIELD);

    let old_bytes = canonical_json_bytes(Value::Object(old_object))?;
    let new_bytes = canonical_json_bytes(Value::Object(new_object))?;
    Ok(old_bytes != new_bytes)
}

/// Compact serialization with object keys sorted at every depth.
pub fn canonical_json_bytes(value: Value) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(&canonicalize(value))?)
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid header {0:?}")]
    InvalidHeader(String),
}

/// Remote data source. Headers are only sent for endpoints that need them.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str, headers: &[(String, String)]) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    async fn fetch_once(&self, url: &str, headers: HeaderMap) -> Result<Vec<u8>, FetchError> {
        // The semaphore is owned by self and never closed.
        let _permit = self.global_limit.acquire().await.ok();

        let resp = self.client.get(url).headers(headers).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str, headers: &[(String, String)]) -> Result<Vec<u8>, FetchError> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| FetchError::InvalidHeader(name.clone()))?;
            let value =
                HeaderValue::from_str(value).map_err(|_| FetchError::InvalidHeader(name.as_str().to_string()))?;
            map.insert(name, value);
        }

        self.fetch_once(url, map)
            .instrument(info_span!("http_fetch", url))
            .await
    }
}
