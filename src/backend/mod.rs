//! Remote sync backends.
//!
//! The engine only talks to [`SyncBackend`]; the three variants differ in how
//! a `{bucket}/{audience}/{variant}.jpg` key maps onto their storage:
//!
//! - [`LocalBackend`]: nested directories under a root path.
//! - [`ObjectStoreBackend`]: flat keys in an S3-compatible bucket.
//! - [`DriveBackend`]: a folder tree in a Drive-style document API.

pub mod drive;
pub mod local;
pub mod object_store;

pub use drive::{DriveBackend, DriveConfig};
pub use local::LocalBackend;
pub use object_store::{ObjectStoreBackend, S3Config};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::StatusCode;
use std::{future::Future, path::PathBuf, sync::Arc};
use tokio::sync::OnceCell;
use thiserror::Error;

use crate::placement::ArtifactKey;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("artifact not found: {0}")]
    NotFound(String),
    #[error("credentials rejected (HTTP {0})")]
    Unauthorized(StatusCode),
    #[error("unexpected HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("request failed: {0}")]
    Request(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid artifact key {0:?}")]
    InvalidKey(String),
    #[error("invalid response: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Credential rejections cannot succeed for any later variant either.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::Unauthorized(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }

    pub(crate) fn from_status(status: StatusCode, body: String) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Unauthorized(status),
            StatusCode::NOT_FOUND => BackendError::NotFound(body),
            _ => BackendError::Status { status, body },
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Request(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: usize,
}

#[async_trait]
pub trait SyncBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stores `bytes` under `key`, replacing any previous artifact. Returns a location ref.
    async fn put(&self, key: &ArtifactKey, bytes: Bytes) -> Result<String, BackendError>;

    /// Removes the artifact; `BackendError::NotFound` when the backend can tell nothing was there.
    async fn delete(&self, key: &ArtifactKey) -> Result<(), BackendError>;

    async fn exists(&self, key: &ArtifactKey) -> Result<bool, BackendError>;

    /// Deletes empty audience and bucket containers, bottom-up. Flat keyspaces keep the default.
    async fn prune_empty_containers(&self) -> Result<PruneReport, BackendError> {
        Ok(PruneReport::default())
    }
}

/// Splits a key into `(bucket, audience, file)`.
pub(crate) fn split_key(key: &ArtifactKey) -> Result<(&str, &str, &str), BackendError> {
    let mut segments = key.segments();
    match (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) {
        (Some(bucket), Some(audience), Some(file), None)
            if [bucket, audience, file]
                .iter()
                .all(|s| !s.is_empty() && *s != "." && *s != "..") =>
        {
            Ok((bucket, audience, file))
        }
        _ => Err(BackendError::InvalidKey(key.to_string())),
    }
}

/// Memoized container ids keyed by `(parent, name)`.
///
/// Shared by every in-flight variant. Resolution through
/// [`FolderCache::get_or_try_init`] is single-flight per pair, so concurrent
/// misses create a container once; a failed resolution leaves the slot empty.
#[derive(Debug, Default)]
pub struct FolderCache {
    entries: DashMap<(String, String), Arc<OnceCell<String>>>,
}

impl FolderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, parent: &str, name: &str) -> Option<String> {
        self.entries
            .get(&(parent.to_string(), name.to_string()))
            .and_then(|entry| entry.value().get().cloned())
    }

    fn slot(&self, parent: &str, name: &str) -> Arc<OnceCell<String>> {
        self.entries
            .entry((parent.to_string(), name.to_string()))
            .or_default()
            .clone()
    }

    /// Inserts unless present and returns whichever id is cached afterwards.
    pub fn insert_if_absent(&self, parent: &str, name: &str, id: String) -> String {
        let slot = self.slot(parent, name);
        let _ = slot.set(id.clone());
        slot.get().cloned().unwrap_or(id)
    }

    pub async fn get_or_try_init<F, Fut, E>(&self, parent: &str, name: &str, init: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        let slot = self.slot(parent, name);
        slot.get_or_try_init(init).await.cloned()
    }

    pub fn evict(&self, parent: &str, name: &str) {
        self.entries.remove(&(parent.to_string(), name.to_string()));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }
}
