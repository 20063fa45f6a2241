//! Google Drive v3 API client
//!
//! Typed HTTP client for the Drive REST API. Handles authentication
//! headers, pagination, JSON deserialization, and streamed downloads.
//!
//! Uploads are two requests: metadata first (`POST /files`), then content
//! (`PATCH .../files/{id}?uploadType=media` against the upload host). This
//! keeps the wire format trivial at the cost of one extra round trip.

use std::path::Path;

use futures_util::StreamExt;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

/// Base URL for Drive v3 metadata operations
const DRIVE_BASE_URL: &str = "https://www.googleapis.com/drive/v3";

/// Base URL for Drive v3 content uploads
const DRIVE_UPLOAD_BASE_URL: &str = "https://www.googleapis.com/upload/drive/v3";

/// Metadata fields requested for every file
const FILE_FIELDS: &str = "id,name,mimeType,modifiedTime,md5Checksum,size,trashed";

/// Page size for listing requests
const PAGE_SIZE: u32 = 100;

/// Default transfer chunk size when none is configured (256 KiB)
const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

// ============================================================================
// Errors
// ============================================================================

/// Errors from Drive API operations
#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Drive API returned {status}: {body}")]
    Api { status: StatusCode, body: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Response types
// ============================================================================

/// One file's metadata as returned by the Drive API
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: Option<String>,
    /// RFC 3339 timestamp string; treated as opaque by callers
    pub modified_time: Option<String>,
    pub md5_checksum: Option<String>,
    /// Drive reports size as a decimal string
    size: Option<String>,
    #[serde(default)]
    pub trashed: bool,
}

impl DriveFile {
    /// Size in bytes, when the API reported one
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_deref().and_then(|s| s.parse().ok())
    }
}

/// Response from `GET /files`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

// ============================================================================
// DriveClient
// ============================================================================

/// HTTP client for Google Drive v3 API calls
///
/// Wraps `reqwest::Client` with authentication headers and URL construction
/// for both the metadata host and the upload host.
pub struct DriveClient {
    client: Client,
    base_url: String,
    upload_base_url: String,
    access_token: String,
    chunk_size: usize,
}

impl DriveClient {
    /// Creates a client against the production Drive endpoints
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: DRIVE_BASE_URL.to_string(),
            upload_base_url: DRIVE_UPLOAD_BASE_URL.to_string(),
            access_token: access_token.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Creates a client with custom base URLs (useful for testing)
    pub fn with_base_urls(
        access_token: impl Into<String>,
        base_url: impl Into<String>,
        upload_base_url: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            upload_base_url: upload_base_url.into(),
            access_token: access_token.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Sets the transfer chunk size in bytes
    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    /// Updates the access token (e.g. after a refresh)
    pub fn set_access_token(&mut self, token: impl Into<String>) {
        self.access_token = token.into();
        debug!("updated Drive access token");
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .request(method, &url)
            .bearer_auth(&self.access_token)
    }

    fn upload_request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.upload_base_url, path);
        self.client
            .request(method, &url)
            .bearer_auth(&self.access_token)
    }

    async fn check(response: Response) -> Result<Response, DriveError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DriveError::Api { status, body })
    }

    // ========================================================================
    // Listing and metadata
    // ========================================================================

    /// Lists all non-trashed files directly under `folder` (root when `None`)
    ///
    /// Follows `nextPageToken` until the listing is exhausted.
    pub async fn list_files(&self, folder: Option<&str>) -> Result<Vec<DriveFile>, DriveError> {
        let parent = folder.unwrap_or("root");
        let query = format!("'{}' in parents and trashed = false", escape_query(parent));
        let fields = format!("nextPageToken,files({FILE_FIELDS})");

        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .request(Method::GET, "/files")
                .query(&[("q", query.as_str())])
                .query(&[("fields", fields.as_str())])
                .query(&[("pageSize", PAGE_SIZE.to_string().as_str())]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let page: FileListResponse =
                Self::check(request.send().await?).await?.json().await?;

            files.extend(page.files);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(count = files.len(), "listed Drive folder");
        Ok(files)
    }

    /// Fetches metadata for one file; `Ok(None)` for missing or trashed files
    pub async fn get_file(&self, id: &str) -> Result<Option<DriveFile>, DriveError> {
        let response = self
            .request(Method::GET, &format!("/files/{id}"))
            .query(&[("fields", FILE_FIELDS)])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let file: DriveFile = Self::check(response).await?.json().await?;
        if file.trashed {
            return Ok(None);
        }
        Ok(Some(file))
    }

    /// Finds a non-trashed file by exact name under `folder`
    pub async fn search_by_name(
        &self,
        name: &str,
        folder: Option<&str>,
    ) -> Result<Option<DriveFile>, DriveError> {
        let parent = folder.unwrap_or("root");
        let query = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            escape_query(name),
            escape_query(parent)
        );
        let fields = format!("files({FILE_FIELDS})");

        let response = self
            .request(Method::GET, "/files")
            .query(&[("q", query.as_str()), ("fields", fields.as_str())])
            .query(&[("pageSize", "1")])
            .send()
            .await?;
        let page: FileListResponse = Self::check(response).await?.json().await?;
        Ok(page.files.into_iter().next())
    }

    // ========================================================================
    // Content transfer
    // ========================================================================

    /// Downloads a file's content to `dest`
    ///
    /// Streams into a sibling temp file and renames into place, so a failed
    /// download never leaves a truncated file at `dest`. Parent directories
    /// are created as needed.
    pub async fn download_to(&self, id: &str, dest: &Path) -> Result<(), DriveError> {
        let response = self
            .request(Method::GET, &format!("/files/{id}"))
            .query(&[("alt", "media")])
            .send()
            .await?;
        let response = Self::check(response).await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = dest.with_extension("mirror.part");
        let mut file = tokio::fs::File::create(&tmp).await?;

        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
            written += chunk.len() as u64;
        }
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        drop(file);

        tokio::fs::rename(&tmp, dest).await?;
        debug!(id, bytes = written, dest = %dest.display(), "downloaded file");
        Ok(())
    }

    /// Creates a file entry with no content and returns its id
    pub async fn create_file(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<String, DriveError> {
        let mut metadata = json!({ "name": name });
        if let Some(parent) = parent {
            metadata["parents"] = json!([parent]);
        }

        let response = self
            .request(Method::POST, "/files")
            .json(&metadata)
            .send()
            .await?;
        let created: DriveFile = Self::check(response).await?.json().await?;
        debug!(name, id = %created.id, "created Drive file entry");
        Ok(created.id)
    }

    /// Replaces the content of an existing file
    ///
    /// The body is streamed from disk in chunks of the configured size, so
    /// large files never sit whole in memory.
    pub async fn upload_content(&self, id: &str, local: &Path) -> Result<(), DriveError> {
        let file = tokio::fs::File::open(local).await?;
        let size = file.metadata().await?.len();
        let stream = tokio_util::io::ReaderStream::with_capacity(file, self.chunk_size);

        let response = self
            .upload_request(Method::PATCH, &format!("/files/{id}"))
            .query(&[("uploadType", "media")])
            .header("Content-Type", "application/octet-stream")
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?;
        Self::check(response).await?;
        debug!(id, bytes = size, "uploaded file content");
        Ok(())
    }

    /// Creates a folder and returns its id
    pub async fn create_folder(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<String, DriveError> {
        let mut metadata = json!({
            "name": name,
            "mimeType": "application/vnd.google-apps.folder",
        });
        if let Some(parent) = parent {
            metadata["parents"] = json!([parent]);
        }

        let response = self
            .request(Method::POST, "/files")
            .json(&metadata)
            .send()
            .await?;
        let created: DriveFile = Self::check(response).await?.json().await?;
        debug!(name, id = %created.id, "created Drive folder");
        Ok(created.id)
    }

    /// Deletes a file; an already-absent file is treated as success
    pub async fn delete_file(&self, id: &str) -> Result<(), DriveError> {
        let response = self
            .request(Method::DELETE, &format!("/files/{id}"))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                warn!(id, "delete target already absent");
                Ok(())
            }
            _ => {
                Self::check(response).await?;
                Ok(())
            }
        }
    }
}

/// Escapes single quotes and backslashes for Drive query strings
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

// ============================================================================
// Unit tests
// ============================================================================
