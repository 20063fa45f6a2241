//! Remote store adapter backed by [`DriveClient`]
//!
//! Maps the port-level [`IRemoteStore`] contract onto Drive API calls and
//! converts Drive metadata into the engine's [`RemoteFile`] DTO.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use drivemirror_core::domain::newtypes::RemoteId;
use drivemirror_core::ports::remote_store::{IRemoteStore, RemoteFile};

use crate::client::{DriveClient, DriveFile};

/// [`IRemoteStore`] implementation for Google Drive
pub struct DriveRemoteStore {
    client: DriveClient,
}

impl DriveRemoteStore {
    pub fn new(client: DriveClient) -> Self {
        Self { client }
    }
}

fn to_remote_file(file: DriveFile) -> Result<RemoteFile> {
    let size = file.size_bytes();
    Ok(RemoteFile {
        id: RemoteId::new(&file.id).context("Drive returned an empty file id")?,
        name: file.name,
        mime_type: file.mime_type,
        modified: file.modified_time,
        checksum: file.md5_checksum,
        size,
    })
}

#[async_trait::async_trait]
impl IRemoteStore for DriveRemoteStore {
    async fn list(&self, folder: Option<&RemoteId>) -> Result<Vec<RemoteFile>> {
        let files = self
            .client
            .list_files(folder.map(|f| f.as_str()))
            .await
            .context("Drive listing failed")?;
        files.into_iter().map(to_remote_file).collect()
    }

    async fn get_metadata(&self, id: &RemoteId) -> Result<Option<RemoteFile>> {
        let file = self
            .client
            .get_file(id.as_str())
            .await
            .context("Drive metadata fetch failed")?;
        file.map(to_remote_file).transpose()
    }

    async fn upload(
        &self,
        local: &Path,
        name: &str,
        parent: Option<&RemoteId>,
        existing: Option<&RemoteId>,
    ) -> Result<RemoteId> {
        let id = match existing {
            Some(id) => id.clone(),
            None => {
                // reuse a same-named remote file rather than creating a twin
                let found = self
                    .client
                    .search_by_name(name, parent.map(|p| p.as_str()))
                    .await
                    .context("Drive search failed")?;
                match found {
                    Some(file) => {
                        debug!(name, id = %file.id, "reusing existing remote file");
                        RemoteId::new(&file.id).context("Drive returned an empty file id")?
                    }
                    None => {
                        let id = self
                            .client
                            .create_file(name, parent.map(|p| p.as_str()))
                            .await
                            .context("Drive file creation failed")?;
                        RemoteId::new(&id).context("Drive returned an empty file id")?
                    }
                }
            }
        };

        self.client
            .upload_content(id.as_str(), local)
            .await
            .context("Drive content upload failed")?;
        Ok(id)
    }

    async fn download(&self, id: &RemoteId, dest: &Path) -> Result<()> {
        self.client
            .download_to(id.as_str(), dest)
            .await
            .context("Drive download failed")
    }

    async fn delete(&self, id: &RemoteId) -> Result<()> {
        self.client
            .delete_file(id.as_str())
            .await
            .context("Drive delete failed")
    }

    async fn create_folder(&self, name: &str, parent: Option<&RemoteId>) -> Result<RemoteId> {
        let id = self
            .client
            .create_folder(name, parent.map(|p| p.as_str()))
            .await
            .context("Drive folder creation failed")?;
        RemoteId::new(&id).context("Drive returned an empty folder id")
    }

    async fn search_by_name(
        &self,
        name: &str,
        parent: Option<&RemoteId>,
    ) -> Result<Option<RemoteFile>> {
        let found = self
            .client
            .search_by_name(name, parent.map(|p| p.as_str()))
            .await
            .context("Drive search failed")?;
        found.map(to_remote_file).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> DriveRemoteStore {
        DriveRemoteStore::new(DriveClient::with_base_urls(
            "test-token",
            server.uri(),
            server.uri(),
        ))
    }

    fn file_json(id: &str, name: &str) -> serde_json::Value {
        json!({
            "id": id,
            "name": name,
            "mimeType": "text/plain",
            "modifiedTime": "2024-01-01T00:00:00.000Z",
            "size": "4",
        })
    }

    #[tokio::test]
    async fn list_maps_metadata_onto_remote_files() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [file_json("id-1", "a.txt")],
            })))
            .mount(&server)
            .await;

        let files = store_for(&server).list(None).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].id.as_str(), "id-1");
        assert_eq!(files[0].name, "a.txt");
        assert_eq!(files[0].modified.as_deref(), Some("2024-01-01T00:00:00.000Z"));
        assert_eq!(files[0].size, Some(4));
    }

    #[tokio::test]
    async fn upload_without_existing_id_searches_before_creating() {
        let server = MockServer::start().await;
        // search finds a same-named file, so no create happens
        Mock::given(method("GET"))
            .and(path("/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [file_json("found-id", "a.txt")],
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/files/found-id"))
            .and(query_param("uploadType", "media"))
            .respond_with(ResponseTemplate::new(200).set_body_json(file_json("found-id", "a.txt")))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.txt");
        std::fs::write(&local, b"data").unwrap();

        let id = store_for(&server)
            .upload(&local, "a.txt", None, None)
            .await
            .unwrap();
        assert_eq!(id.as_str(), "found-id");
    }

    #[tokio::test]
    async fn upload_with_existing_id_skips_search_and_create() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/files/known-id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(file_json("known-id", "a.txt")))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.txt");
        std::fs::write(&local, b"data").unwrap();

        let existing = RemoteId::new("known-id").unwrap();
        let id = store_for(&server)
            .upload(&local, "a.txt", None, Some(&existing))
            .await
            .unwrap();
        assert_eq!(id, existing);
    }

    #[tokio::test]
    async fn delete_is_error_tolerant_for_missing_files() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/files/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let id = RemoteId::new("gone").unwrap();
        store_for(&server).delete(&id).await.unwrap();
    }
}
