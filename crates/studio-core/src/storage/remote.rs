//! Client-side view of the server's output directory. Files are written by
//! the server during generation, so this backend only checks, fetches and
//! deletes.

use async_trait::async_trait;
use std::sync::Arc;

use super::{validate_filename, ImageBackend, StorageError};
use crate::api::StudioApi;
use crate::types::StorageMode;

#[derive(Clone)]
pub struct RemoteFilesystemBackend {
    api: Arc<dyn StudioApi>,
    password_hash: Option<String>,
}

impl RemoteFilesystemBackend {
    pub fn new(api: Arc<dyn StudioApi>, password_hash: Option<String>) -> Self {
        Self { api, password_hash }
    }
}

#[async_trait]
impl ImageBackend for RemoteFilesystemBackend {
    fn mode(&self) -> StorageMode {
        StorageMode::Filesystem
    }

    async fn put(&self, _filename: &str, _bytes: &[u8], _content_type: &str) -> Result<String, StorageError> {
        Err(StorageError::Unsupported {
            mode: StorageMode::Filesystem,
            operation: "client-side put",
        })
    }

    async fn resolve(&self, filename: &str) -> Result<Option<String>, StorageError> {
        let filename = validate_filename(filename)?;
        let exists = self
            .api
            .image_exists(filename)
            .await
            .map_err(|e| StorageError::Remote(e.to_string()))?;
        Ok(exists.then(|| self.api.image_url(filename)))
    }

    async fn read(&self, filename: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let filename = validate_filename(filename)?;
        self.api
            .fetch_image(filename)
            .await
            .map_err(|e| StorageError::Remote(e.to_string()))
    }

    async fn delete(&self, filename: &str) -> Result<bool, StorageError> {
        let filename = validate_filename(filename)?;
        let response = self
            .api
            .delete_images(vec![filename.to_string()], self.password_hash.clone())
            .await
            .map_err(|e| StorageError::Remote(e.to_string()))?;

        match response.results.into_iter().next() {
            Some(result) if result.success => Ok(true),
            Some(result) if result.error.as_deref() == Some("File not found") => Ok(false),
            Some(result) => Err(StorageError::Remote(
                result.error.unwrap_or_else(|| format!("Failed to delete {}", filename)),
            )),
            None => Err(StorageError::Remote(format!("No delete result for {}", filename))),
        }
    }
}
