//! Embedded-database backend: image bytes live in the client's redb file and
//! are displayed through cached handles.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{validate_filename, ImageBackend, StorageError};
use crate::cache::ImageSourceCache;
use crate::db::{ImageRecord, StudioDb};
use crate::types::StorageMode;

#[derive(Clone)]
pub struct EmbeddedDbBackend {
    db: Arc<StudioDb>,
    cache: Arc<ImageSourceCache>,
}

impl EmbeddedDbBackend {
    pub fn new(db: Arc<StudioDb>, cache: Arc<ImageSourceCache>) -> Self {
        Self { db, cache }
    }

    pub fn cache(&self) -> &Arc<ImageSourceCache> {
        &self.cache
    }

    /// Remove every stored image and release all handles
    pub async fn clear(&self) -> Result<usize, StorageError> {
        let removed = self
            .db
            .clear_images()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        self.cache.clear().await;
        Ok(removed)
    }
}

#[async_trait]
impl ImageBackend for EmbeddedDbBackend {
    fn mode(&self) -> StorageMode {
        StorageMode::EmbeddedDb
    }

    async fn put(&self, filename: &str, bytes: &[u8], content_type: &str) -> Result<String, StorageError> {
        let filename = validate_filename(filename)?;
        self.db
            .store_image(&ImageRecord {
                filename: filename.to_string(),
                content_type: content_type.to_string(),
                blob: bytes.to_vec(),
                stored_at: chrono::Utc::now().timestamp_millis(),
            })
            .map_err(|e| StorageError::Database(e.to_string()))?;

        // A previous handle for the same name would show stale bytes
        self.cache.invalidate(filename).await;
        self.resolve(filename)
            .await?
            .ok_or_else(|| StorageError::Database(format!("Image {} vanished after write", filename)))
    }

    async fn resolve(&self, filename: &str) -> Result<Option<String>, StorageError> {
        let filename = validate_filename(filename)?;
        let db = &self.db;
        self.cache
            .get_or_load(filename, || {
                debug!("Loading image blob for {}", filename);
                db.get_image(filename)
                    .map(|record| record.map(|r| r.blob))
                    .map_err(|e| StorageError::Database(e.to_string()))
            })
            .await
    }

    async fn read(&self, filename: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let filename = validate_filename(filename)?;
        self.db
            .get_image(filename)
            .map(|record| record.map(|r| r.blob))
            .map_err(|e| StorageError::Database(e.to_string()))
    }

    async fn delete(&self, filename: &str) -> Result<bool, StorageError> {
        let filename = validate_filename(filename)?;
        let removed = self
            .db
            .delete_image(filename)
            .map_err(|e| StorageError::Database(e.to_string()))?;
        self.cache.invalidate(filename).await;
        Ok(removed)
    }
}
