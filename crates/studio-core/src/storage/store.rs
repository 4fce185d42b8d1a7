//! Routes image references to the backend their history entry was recorded
//! under.

use std::sync::Arc;

use super::{EmbeddedDbBackend, ImageBackend, StorageError};
use crate::types::{HistoryImage, StorageMode};

pub struct ImageStore {
    filesystem: Arc<dyn ImageBackend>,
    embedded: EmbeddedDbBackend,
    object: Arc<dyn ImageBackend>,
}

impl ImageStore {
    pub fn new(filesystem: Arc<dyn ImageBackend>, embedded: EmbeddedDbBackend, object: Arc<dyn ImageBackend>) -> Self {
        Self {
            filesystem,
            embedded,
            object,
        }
    }

    pub fn backend(&self, mode: StorageMode) -> &dyn ImageBackend {
        match mode {
            StorageMode::Filesystem => self.filesystem.as_ref(),
            StorageMode::EmbeddedDb => &self.embedded,
            StorageMode::ObjectStorage => self.object.as_ref(),
        }
    }

    pub fn embedded(&self) -> &EmbeddedDbBackend {
        &self.embedded
    }

    /// Displayable reference for a filename under `mode`
    pub async fn resolve(&self, filename: &str, mode: StorageMode) -> Result<Option<String>, StorageError> {
        self.backend(mode).resolve(filename).await
    }

    /// Like `resolve`, but a URL recorded for an object-storage image wins
    pub async fn resolve_image(&self, image: &HistoryImage, mode: StorageMode) -> Result<Option<String>, StorageError> {
        if mode == StorageMode::ObjectStorage {
            if let Some(url) = &image.url {
                return Ok(Some(url.clone()));
            }
        }
        self.resolve(&image.filename, mode).await
    }

    /// Bytes of an image from the backend its entry was recorded under
    pub async fn read_image(&self, image: &HistoryImage, mode: StorageMode) -> Result<Option<Vec<u8>>, StorageError> {
        self.backend(mode).read(&image.filename).await
    }
}
