//! Folder-tree backend over the Drive v3 REST API.
//!
//! Folders are files with the folder MIME type and are found by
//! `(parent, name)` queries. Resolved folder ids go through the shared
//! [`FolderCache`] so concurrent variants do not repeat lookups, and a
//! missing folder is created by exactly one of them.
//!
//! Listings are ordered by creation time. When duplicate folders already
//! exist, every lookup settles on the oldest one.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{BackendError, FolderCache, PruneReport, SyncBackend, split_key};
use crate::placement::ArtifactKey;

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com";
const LIST_FIELDS: &str = "nextPageToken,files(id,name)";
const LIST_ORDER: &str = "createdTime";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveConfig {
    pub api_base: String,
    pub access_token: String,
    pub root_folder_id: String,
}

#[derive(Clone)]
pub struct DriveBackend {
    http: Client,
    config: DriveConfig,
    folders: Arc<FolderCache>,
}

#[derive(Debug, Clone, Deserialize)]
struct DriveFile {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildKind {
    Folder,
    File,
    Any,
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn child_query(parent: &str, name: Option<&str>, kind: ChildKind) -> String {
    let mut q = format!("'{}' in parents and trashed = false", escape_query(parent));
    if let Some(name) = name {
        q.push_str(&format!(" and name = '{}'", escape_query(name)));
    }
    match kind {
        ChildKind::Folder => q.push_str(&format!(" and mimeType = '{FOLDER_MIME}'")),
        ChildKind::File => q.push_str(&format!(" and mimeType != '{FOLDER_MIME}'")),
        ChildKind::Any => {}
    }
    q
}

fn multipart_body(boundary: &str, metadata: &serde_json::Value, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 256);
    body.extend_from_slice(
        format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(format!("--{boundary}\r\nContent-Type: image/jpeg\r\n\r\n").as_bytes());
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

fn web_link(file_id: &str) -> String {
    format!("https://drive.google.com/file/d/{file_id}/view")
}

impl DriveBackend {
    pub fn new(http: Client, mut config: DriveConfig, folders: Arc<FolderCache>) -> Self {
        config.api_base = config.api_base.trim_end_matches('/').to_string();
        Self {
            http,
            config,
            folders,
        }
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.config.api_base)
    }

    fn upload_url(&self) -> String {
        format!("{}/upload/drive/v3/files", self.config.api_base)
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, BackendError> {
        let response = request.bearer_auth(&self.config.access_token).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, body));
        }
        response
            .json::<T>()
            .await
            .map_err(|err| BackendError::Protocol(err.to_string()))
    }

    async fn list(&self, q: &str) -> Result<Vec<DriveFile>, BackendError> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("q", q.to_string()),
                ("fields", LIST_FIELDS.to_string()),
                ("pageSize", "1000".to_string()),
                ("orderBy", LIST_ORDER.to_string()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }
            let page: FileList = self
                .execute(self.http.get(self.files_url()).query(&params))
                .await?;
            files.extend(page.files);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(files)
    }

    async fn find_child(
        &self,
        parent: &str,
        name: &str,
        kind: ChildKind,
    ) -> Result<Option<DriveFile>, BackendError> {
        Ok(self
            .list(&child_query(parent, Some(name), kind))
            .await?
            .into_iter()
            .next())
    }

    async fn create_folder(&self, parent: &str, name: &str) -> Result<String, BackendError> {
        let metadata = json!({ "name": name, "mimeType": FOLDER_MIME, "parents": [parent] });
        let created: Created = self
            .execute(
                self.http
                    .post(self.files_url())
                    .query(&[("fields", "id")])
                    .json(&metadata),
            )
            .await?;
        info!(target = "vsync.backend.drive", parent = %parent, name = %name, id = %created.id, "folder_created");
        Ok(created.id)
    }

    async fn find_or_create_folder(&self, parent: &str, name: &str) -> Result<String, BackendError> {
        match self.find_child(parent, name, ChildKind::Folder).await? {
            Some(found) => Ok(found.id),
            None => self.create_folder(parent, name).await,
        }
    }

    /// Folder id for `(parent, name)`, creating it when `create` is set.
    async fn folder(
        &self,
        parent: &str,
        name: &str,
        create: bool,
    ) -> Result<Option<String>, BackendError> {
        if let Some(id) = self.folders.get(parent, name) {
            return Ok(Some(id));
        }
        if create {
            let id = self
                .folders
                .get_or_try_init(parent, name, || self.find_or_create_folder(parent, name))
                .await?;
            return Ok(Some(id));
        }
        // Lookups never create, so a miss is not memoized.
        match self.find_child(parent, name, ChildKind::Folder).await? {
            Some(found) => Ok(Some(self.folders.insert_if_absent(parent, name, found.id))),
            None => Ok(None),
        }
    }

    async fn locate(&self, key: &ArtifactKey) -> Result<Option<DriveFile>, BackendError> {
        let (bucket, audience, file) = split_key(key)?;
        let Some(bucket_id) = self
            .folder(&self.config.root_folder_id, bucket, false)
            .await?
        else {
            return Ok(None);
        };
        let Some(audience_id) = self.folder(&bucket_id, audience, false).await? else {
            return Ok(None);
        };
        self.find_child(&audience_id, file, ChildKind::File).await
    }

    async fn upload(
        &self,
        folder_id: &str,
        file: &str,
        bytes: Bytes,
    ) -> Result<String, BackendError> {
        let created: Created = match self.find_child(folder_id, file, ChildKind::File).await? {
            Some(existing) => {
                self.execute(
                    self.http
                        .patch(format!("{}/{}", self.upload_url(), existing.id))
                        .query(&[("uploadType", "media"), ("fields", "id")])
                        .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
                        .body(bytes),
                )
                .await?
            }
            None => {
                let boundary = format!("vsync-{}", Uuid::new_v4().simple());
                let metadata = json!({ "name": file, "parents": [folder_id] });
                self.execute(
                    self.http
                        .post(self.upload_url())
                        .query(&[("uploadType", "multipart"), ("fields", "id")])
                        .header(
                            reqwest::header::CONTENT_TYPE,
                            format!("multipart/related; boundary={boundary}"),
                        )
                        .body(multipart_body(&boundary, &metadata, &bytes)),
                )
                .await?
            }
        };
        Ok(created.id)
    }

    async fn delete_file(&self, id: &str) -> Result<(), BackendError> {
        let response = self
            .http
            .delete(format!("{}/{id}", self.files_url()))
            .bearer_auth(&self.config.access_token)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::from_status(status, body))
    }

    async fn is_empty(&self, folder_id: &str) -> Result<bool, BackendError> {
        Ok(self
            .list(&child_query(folder_id, None, ChildKind::Any))
            .await?
            .is_empty())
    }
}

#[async_trait]
impl SyncBackend for DriveBackend {
    fn name(&self) -> &'static str {
        "drive"
    }

    async fn put(&self, key: &ArtifactKey, bytes: Bytes) -> Result<String, BackendError> {
        let (bucket, audience, file) = split_key(key)?;
        let root = self.config.root_folder_id.as_str();
        let bucket_id = self
            .folder(root, bucket, true)
            .await?
            .ok_or_else(|| BackendError::Protocol(format!("folder {bucket} unavailable")))?;
        let audience_id = self
            .folder(&bucket_id, audience, true)
            .await?
            .ok_or_else(|| BackendError::Protocol(format!("folder {audience} unavailable")))?;
        match self.upload(&audience_id, file, bytes).await {
            Ok(id) => {
                debug!(target = "vsync.backend.drive", key = %key, id = %id, "file_uploaded");
                Ok(web_link(&id))
            }
            Err(err) => {
                // A folder removed behind our back; resolve afresh next time.
                if err.is_not_found() {
                    self.folders.evict(root, bucket);
                    self.folders.evict(&bucket_id, audience);
                }
                Err(err)
            }
        }
    }

    async fn delete(&self, key: &ArtifactKey) -> Result<(), BackendError> {
        match self.locate(key).await? {
            Some(file) => self.delete_file(&file.id).await,
            None => Err(BackendError::NotFound(key.to_string())),
        }
    }

    async fn exists(&self, key: &ArtifactKey) -> Result<bool, BackendError> {
        Ok(self.locate(key).await?.is_some())
    }

    async fn prune_empty_containers(&self) -> Result<PruneReport, BackendError> {
        let root = self.config.root_folder_id.as_str();
        let mut report = PruneReport::default();
        for bucket in self.list(&child_query(root, None, ChildKind::Folder)).await? {
            for audience in self
                .list(&child_query(&bucket.id, None, ChildKind::Folder))
                .await?
            {
                if self.is_empty(&audience.id).await? {
                    self.delete_file(&audience.id).await?;
                    self.folders.evict(&bucket.id, &audience.name);
                    report.removed += 1;
                }
            }
            if self.is_empty(&bucket.id).await? {
                self.delete_file(&bucket.id).await?;
                self.folders.evict(root, &bucket.name);
                report.removed += 1;
            }
        }
        if report.removed > 0 {
            info!(target = "vsync.backend.drive", removed = report.removed, "containers_pruned");
        }
        Ok(report)
    }
}
