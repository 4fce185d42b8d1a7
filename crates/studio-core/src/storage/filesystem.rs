//! Server-side output directory.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{local_image_path, validate_filename, ImageBackend, StorageError};
use crate::types::StorageMode;

/// Stores images as flat files inside one directory
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    dir: PathBuf,
}

impl FilesystemBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the output directory if it does not exist yet
    pub async fn ensure_dir(&self) -> Result<(), StorageError> {
        if tokio::fs::metadata(&self.dir).await.is_ok() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to create image output directory: {}", e)))?;
        info!("Created output directory: {}", self.dir.display());
        Ok(())
    }

    /// Map a filename to a path strictly inside the output directory
    pub fn path_for(&self, filename: &str) -> Result<PathBuf, StorageError> {
        let filename = validate_filename(filename)?;
        if filename.contains('/') || filename.contains('\\') {
            return Err(StorageError::InvalidFilename(filename.to_string()));
        }
        Ok(self.dir.join(filename))
    }

    /// Read an image, `None` if it does not exist
    pub async fn read(&self, filename: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(filename)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(format!("Failed to read {}: {}", filename, e))),
        }
    }
}

#[async_trait]
impl ImageBackend for FilesystemBackend {
    fn mode(&self) -> StorageMode {
        StorageMode::Filesystem
    }

    async fn put(&self, filename: &str, bytes: &[u8], _content_type: &str) -> Result<String, StorageError> {
        let path = self.path_for(filename)?;
        self.ensure_dir().await?;
        debug!("Saving image to: {}", path.display());
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to save image {}: {}", filename, e)))?;
        info!("Saved image: {} ({} bytes)", filename, bytes.len());
        Ok(local_image_path(filename))
    }

    async fn resolve(&self, filename: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(filename)?;
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(exists.then(|| local_image_path(filename)))
    }

    async fn read(&self, filename: &str) -> Result<Option<Vec<u8>>, StorageError> {
        FilesystemBackend::read(self, filename).await
    }

    async fn delete(&self, filename: &str) -> Result<bool, StorageError> {
        let path = self.path_for(filename)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted image: {}", filename);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(format!("Failed to delete {}: {}", filename, e))),
        }
    }
}
