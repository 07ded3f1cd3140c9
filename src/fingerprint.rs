//! Content fingerprints and the per-artifact record of what was last synced.
//!
//! A fingerprint is a SHA-256 digest used for change detection only. Records
//! are keyed by artifact key and can live in memory, in a JSON file, or in
//! Redis when several replicas share one backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::placement::ArtifactKey;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    #[cfg(test)]
    pub fn of(bytes: &[u8]) -> Self {
        Self::of_parts(&[bytes])
    }

    /// Digest over several buffers, length-prefixed so boundaries cannot shift.
    pub fn of_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("fingerprint store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("fingerprint store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[async_trait]
pub trait FingerprintStore: Send + Sync {
    async fn recorded(&self, key: &ArtifactKey) -> Result<Option<Fingerprint>, FingerprintError>;
    async fn record(&self, key: &ArtifactKey, fingerprint: &Fingerprint)
    -> Result<(), FingerprintError>;
    async fn forget(&self, key: &ArtifactKey) -> Result<(), FingerprintError>;
}

/// True unless a readable record exists and matches bit for bit.
pub async fn has_changed(
    store: &dyn FingerprintStore,
    key: &ArtifactKey,
    fingerprint: &Fingerprint,
) -> bool {
    match store.recorded(key).await {
        Ok(Some(existing)) => existing != *fingerprint,
        Ok(None) => true,
        Err(err) => {
            warn!(target = "vsync.fingerprint", key = %key, error = %err, "fingerprint_read_failed");
            true
        }
    }
}

#[derive(Default)]
pub struct MemoryFingerprints {
    records: DashMap<ArtifactKey, Fingerprint>,
}

impl MemoryFingerprints {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprints {
    async fn recorded(&self, key: &ArtifactKey) -> Result<Option<Fingerprint>, FingerprintError> {
        Ok(self.records.get(key).map(|entry| entry.value().clone()))
    }

    async fn record(
        &self,
        key: &ArtifactKey,
        fingerprint: &Fingerprint,
    ) -> Result<(), FingerprintError> {
        self.records.insert(key.clone(), fingerprint.clone());
        Ok(())
    }

    async fn forget(&self, key: &ArtifactKey) -> Result<(), FingerprintError> {
        self.records.remove(key);
        Ok(())
    }
}

/// On-disk payload of [`FileFingerprints`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FingerprintFile {
    synced_at: DateTime<Utc>,
    artifacts: HashMap<String, Fingerprint>,
}

/// JSON-file backed store. Every mutation rewrites the file atomically and
/// only takes effect in memory once the rewrite succeeded.
pub struct FileFingerprints {
    path: PathBuf,
    records: Mutex<HashMap<String, Fingerprint>>,
}

impl FileFingerprints {
    /// Loads `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, FingerprintError> {
        let path = path.into();
        let records = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
            serde_json::from_str::<FingerprintFile>(&contents)?.artifacts
        } else {
            HashMap::new()
        };
        debug!(target = "vsync.fingerprint", path = %path.display(), records = records.len(), "fingerprint_file_loaded");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    async fn persist(&self, records: &HashMap<String, Fingerprint>) -> Result<(), FingerprintError> {
        let payload = FingerprintFile {
            synced_at: Utc::now(),
            artifacts: records.clone(),
        };
        let json = serde_json::to_string_pretty(&payload)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_err(dir, e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| io_err(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_err(&self.path, e))?;
        Ok(())
    }
}

#[async_trait]
impl FingerprintStore for FileFingerprints {
    async fn recorded(&self, key: &ArtifactKey) -> Result<Option<Fingerprint>, FingerprintError> {
        Ok(self.records.lock().await.get(key.as_str()).cloned())
    }

    async fn record(
        &self,
        key: &ArtifactKey,
        fingerprint: &Fingerprint,
    ) -> Result<(), FingerprintError> {
        let mut guard = self.records.lock().await;
        let previous = guard.insert(key.to_string(), fingerprint.clone());
        if let Err(err) = self.persist(&guard).await {
            // Memory never runs ahead of the file.
            match previous {
                Some(previous) => guard.insert(key.to_string(), previous),
                None => guard.remove(key.as_str()),
            };
            return Err(err);
        }
        Ok(())
    }

    async fn forget(&self, key: &ArtifactKey) -> Result<(), FingerprintError> {
        let mut guard = self.records.lock().await;
        let Some(previous) = guard.remove(key.as_str()) else {
            return Ok(());
        };
        if let Err(err) = self.persist(&guard).await {
            guard.insert(key.to_string(), previous);
            return Err(err);
        }
        Ok(())
    }
}

fn io_err(path: &Path, source: std::io::Error) -> FingerprintError {
    FingerprintError::Io {
        path: path.to_path_buf(),
        source,
    }
}

const REDIS_PREFIX: &str = "vsync:fp:";

pub struct RedisFingerprints {
    client: redis::Client,
}

impl RedisFingerprints {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    fn redis_key(key: &ArtifactKey) -> String {
        format!("{REDIS_PREFIX}{key}")
    }
}

#[async_trait]
impl FingerprintStore for RedisFingerprints {
    async fn recorded(&self, key: &ArtifactKey) -> Result<Option<Fingerprint>, FingerprintError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.get(Self::redis_key(key)).await?;
        Ok(value.map(Fingerprint))
    }

    async fn record(
        &self,
        key: &ArtifactKey,
        fingerprint: &Fingerprint,
    ) -> Result<(), FingerprintError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn
            .set(Self::redis_key(key), fingerprint.as_str())
            .await?;
        Ok(())
    }

    async fn forget(&self, key: &ArtifactKey) -> Result<(), FingerprintError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(Self::redis_key(key)).await?;
        Ok(())
    }
}
