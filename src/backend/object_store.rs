//! S3-compatible object storage (R2, MinIO, S3) through an `opendal` operator.
//!
//! Keys map one-to-one onto object paths. Requests are path-style, so the
//! bucket is the first URL segment under the endpoint.

use async_trait::async_trait;
use bytes::Bytes;
use opendal::{ErrorKind, Operator, services::S3};
use reqwest::StatusCode;
use tracing::debug;

use super::{BackendError, SyncBackend};
use crate::placement::ArtifactKey;

const JPEG_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub public_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    op: Operator,
    config: S3Config,
}

impl From<opendal::Error> for BackendError {
    fn from(err: opendal::Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => BackendError::NotFound(err.to_string()),
            ErrorKind::PermissionDenied => BackendError::Unauthorized(StatusCode::FORBIDDEN),
            ErrorKind::ConfigInvalid => BackendError::Protocol(err.to_string()),
            _ => BackendError::Request(err.to_string()),
        }
    }
}

impl ObjectStoreBackend {
    pub fn new(mut config: S3Config) -> Result<Self, BackendError> {
        config.endpoint = config.endpoint.trim_end_matches('/').to_string();
        let builder = S3::default()
            .endpoint(&config.endpoint)
            .bucket(&config.bucket)
            .region(&config.region)
            .access_key_id(&config.access_key)
            .secret_access_key(&config.secret_key)
            .disable_config_load();
        let op = Operator::new(builder)?.finish();
        Ok(Self { op, config })
    }

    fn location(&self, key: &ArtifactKey) -> String {
        match &self.config.public_url {
            Some(base) => format!("{}/{key}", base.trim_end_matches('/')),
            None => format!("{}/{}/{key}", self.config.endpoint, self.config.bucket),
        }
    }
}

#[async_trait]
impl SyncBackend for ObjectStoreBackend {
    fn name(&self) -> &'static str {
        "object_store"
    }

    async fn put(&self, key: &ArtifactKey, bytes: Bytes) -> Result<String, BackendError> {
        self.op
            .write_with(key.as_str(), bytes)
            .content_type(JPEG_CONTENT_TYPE)
            .await?;
        debug!(target = "vsync.backend.object_store", key = %key, "object_put");
        Ok(self.location(key))
    }

    /// S3 deletes are idempotent, so a missing key also returns `Ok`.
    async fn delete(&self, key: &ArtifactKey) -> Result<(), BackendError> {
        self.op.delete(key.as_str()).await?;
        Ok(())
    }

    /// A denied HEAD reads as absent: S3 answers 403 for a missing key when
    /// the credentials lack `ListBucket`. A denied put still aborts the event.
    async fn exists(&self, key: &ArtifactKey) -> Result<bool, BackendError> {
        match self.op.stat(key.as_str()).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                debug!(target = "vsync.backend.object_store", key = %key, error = %err, "head_denied");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}
