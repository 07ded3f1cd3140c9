use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::Write,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{BackendError, PruneReport, SyncBackend, split_key};
use crate::placement::ArtifactKey;

/// Artifacts as files under `root/{bucket}/{audience}/`.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &ArtifactKey) -> Result<PathBuf, BackendError> {
        let (bucket, audience, file) = split_key(key)?;
        Ok(self.root.join(bucket).join(audience).join(file))
    }
}

fn io_err(path: &Path, source: std::io::Error) -> BackendError {
    BackendError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// The temp file lives next to the target so the final rename stays on one
// filesystem; dropping it on any error path removes it.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), BackendError> {
    let dir = path
        .parent()
        .ok_or_else(|| BackendError::InvalidKey(path.display().to_string()))?;
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| io_err(dir, e))?;
    tmp.write_all(bytes).map_err(|e| io_err(tmp.path(), e))?;
    tmp.flush().map_err(|e| io_err(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| io_err(path, e.error))?;
    Ok(())
}

fn is_empty_dir(path: &Path) -> Result<bool, BackendError> {
    Ok(std::fs::read_dir(path)
        .map_err(|e| io_err(path, e))?
        .next()
        .is_none())
}

fn child_dirs(path: &Path) -> Result<Vec<PathBuf>, BackendError> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(path).map_err(|e| io_err(path, e))? {
        let entry = entry.map_err(|e| io_err(path, e))?;
        if entry.file_type().map_err(|e| io_err(&entry.path(), e))?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn prune_tree(root: &Path) -> Result<PruneReport, BackendError> {
    let mut report = PruneReport::default();
    if !root.exists() {
        return Ok(report);
    }
    for bucket in child_dirs(root)? {
        for audience in child_dirs(&bucket)? {
            if is_empty_dir(&audience)? {
                std::fs::remove_dir(&audience).map_err(|e| io_err(&audience, e))?;
                debug!(target = "vsync.backend.local", path = %audience.display(), "container_removed");
                report.removed += 1;
            }
        }
        if is_empty_dir(&bucket)? {
            std::fs::remove_dir(&bucket).map_err(|e| io_err(&bucket, e))?;
            debug!(target = "vsync.backend.local", path = %bucket.display(), "container_removed");
            report.removed += 1;
        }
    }
    Ok(report)
}

async fn blocking<T, F>(task: F) -> Result<T, BackendError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BackendError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| BackendError::Request(format!("blocking task failed: {err}")))?
}

#[async_trait]
impl SyncBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn put(&self, key: &ArtifactKey, bytes: Bytes) -> Result<String, BackendError> {
        let path = self.path_for(key)?;
        let target = path.clone();
        blocking(move || write_atomic(&target, &bytes)).await?;
        Ok(path.display().to_string())
    }

    async fn delete(&self, key: &ArtifactKey) -> Result<(), BackendError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::NotFound(key.to_string()))
            }
            Err(err) => Err(io_err(&path, err)),
        }
    }

    async fn exists(&self, key: &ArtifactKey) -> Result<bool, BackendError> {
        let path = self.path_for(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_err(&path, e))
    }

    async fn prune_empty_containers(&self) -> Result<PruneReport, BackendError> {
        let root = self.root.clone();
        let report = blocking(move || prune_tree(&root)).await?;
        if report.removed > 0 {
            info!(target = "vsync.backend.local", removed = report.removed, "containers_pruned");
        }
        Ok(report)
    }
}
