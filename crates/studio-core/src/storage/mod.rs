//! ============================================================================
//! Storage Module - Pluggable image persistence
//! ============================================================================
//! Every backend exposes the same operations: `put`, `resolve`, `read` and
//! `delete`. Which one is used is decided once by the storage mode.
//!
//! - FilesystemBackend: server output directory, served at `/api/image/<f>`
//! - EmbeddedDbBackend: client redb blobs, resolved to cached handles
//! - ObjectStorageBackend: S3-compatible bucket, resolved to public URLs
//! - RemoteFilesystemBackend: the client's view of the server's disk
//!
//! `ImageStore` picks the backend a history entry was recorded under.
//! ============================================================================

mod embedded;
mod filesystem;
mod object;
mod remote;
pub mod s3;
mod store;

pub use embedded::EmbeddedDbBackend;
pub use filesystem::FilesystemBackend;
pub use object::ObjectStorageBackend;
pub use remote::RemoteFilesystemBackend;
pub use s3::S3Client;
pub use store::ImageStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::StorageMode;

/// Route that serves filesystem-mode images
pub const LOCAL_IMAGE_ROUTE: &str = "/api/image";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid filename: {0}")]
    InvalidFilename(String),
    #[error("{operation} is not supported by {mode} storage")]
    Unsupported {
        mode: StorageMode,
        operation: &'static str,
    },
    #[error("Storage not configured: {0}")]
    NotConfigured(String),
    #[error("Filesystem error: {0}")]
    Io(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Object storage error: {0}")]
    ObjectStorage(String),
    #[error("Remote storage error: {0}")]
    Remote(String),
}

/// Uniform interface over the storage backends
#[async_trait]
pub trait ImageBackend: Send + Sync {
    fn mode(&self) -> StorageMode;

    /// Persist bytes under `filename`, returning a displayable reference
    async fn put(&self, filename: &str, bytes: &[u8], content_type: &str) -> Result<String, StorageError>;

    /// Displayable reference for `filename`, or `None` when it is gone
    async fn resolve(&self, filename: &str) -> Result<Option<String>, StorageError>;

    /// Stored bytes of `filename`, or `None` when it is gone
    async fn read(&self, filename: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Remove `filename`; returns whether something was deleted
    async fn delete(&self, filename: &str) -> Result<bool, StorageError>;
}

/// Reject names that could escape the storage root.
pub fn validate_filename(filename: &str) -> Result<&str, StorageError> {
    if filename.is_empty()
        || filename.contains("..")
        || filename.starts_with('/')
        || filename.starts_with('\\')
        || filename.contains('\0')
    {
        return Err(StorageError::InvalidFilename(filename.to_string()));
    }
    Ok(filename)
}

/// Path the server serves a filesystem-mode image from
pub fn local_image_path(filename: &str) -> String {
    format!("{}/{}", LOCAL_IMAGE_ROUTE, filename)
}

/// Content type from the file extension
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}
