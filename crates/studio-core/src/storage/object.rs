//! Object storage backend: images live in an S3-compatible bucket and are
//! referenced by their public URL.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{validate_filename, ImageBackend, S3Client, StorageError};
use crate::config::{PublicUrlSettings, S3Settings};
use crate::types::StorageMode;

#[derive(Clone)]
pub struct ObjectStorageBackend {
    urls: PublicUrlSettings,
    /// Absent on the client, which only builds URLs
    client: Option<S3Client>,
    /// Fetches objects back through their public URL
    http: reqwest::Client,
}

impl ObjectStorageBackend {
    /// Backend that can upload as well as resolve
    pub fn new(settings: &S3Settings, urls: PublicUrlSettings) -> Result<Self, StorageError> {
        Ok(Self {
            urls,
            client: Some(S3Client::new(settings)?),
            http: reqwest::Client::new(),
        })
    }

    /// URL-only backend; `put` fails with `NotConfigured`
    pub fn read_only(urls: PublicUrlSettings) -> Self {
        Self {
            urls,
            client: None,
            http: reqwest::Client::new(),
        }
    }

    /// Bucket key of a generated image
    pub fn key_for(&self, filename: &str) -> String {
        if self.urls.key_prefix.is_empty() {
            filename.to_string()
        } else {
            format!("{}/{}", self.urls.key_prefix, filename)
        }
    }

    /// Public URL of an object key, `None` when no domain can be derived
    pub fn public_url(&self, key: &str) -> Option<String> {
        match (&self.urls.public_domain, &self.client) {
            (Some(domain), _) => Some(format!("{}/{}", domain, key)),
            (None, Some(client)) => Some(client.object_url(key)),
            (None, None) => None,
        }
    }

    /// Upload under an explicit key, returning its public URL
    pub async fn put_key(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String, StorageError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| StorageError::NotConfigured("object storage credentials are missing".into()))?;
        client.put_object(key, bytes, content_type).await?;
        self.public_url(key)
            .ok_or_else(|| StorageError::NotConfigured("no public domain for object storage".into()))
    }

    /// Download an object by URL; 403 and 404 both mean it is gone
    pub async fn fetch(&self, url: &str) -> Result<Option<Vec<u8>>, StorageError> {
        debug!("Fetching object {}", url);
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| StorageError::ObjectStorage(format!("Failed to fetch {}: {}", url, e)))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::FORBIDDEN {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StorageError::ObjectStorage(format!(
                "Fetching {} failed with status {}",
                url,
                status.as_u16()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StorageError::ObjectStorage(format!("Failed to read {}: {}", url, e)))?;
        Ok(Some(bytes.to_vec()))
    }
}

#[async_trait]
impl ImageBackend for ObjectStorageBackend {
    fn mode(&self) -> StorageMode {
        StorageMode::ObjectStorage
    }

    async fn put(&self, filename: &str, bytes: &[u8], content_type: &str) -> Result<String, StorageError> {
        let filename = validate_filename(filename)?;
        self.put_key(&self.key_for(filename), bytes, content_type).await
    }

    /// Deterministic; the object is not checked for existence.
    async fn resolve(&self, filename: &str) -> Result<Option<String>, StorageError> {
        let filename = validate_filename(filename)?;
        let url = self.public_url(&self.key_for(filename));
        if url.is_none() {
            warn!("Cannot build a public URL for {}: no public domain configured", filename);
        }
        Ok(url)
    }

    async fn read(&self, filename: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let url = match self.resolve(filename).await? {
            Some(url) => url,
            None => return Ok(None),
        };
        self.fetch(&url).await
    }

    async fn delete(&self, filename: &str) -> Result<bool, StorageError> {
        debug!("Refusing to delete {} from object storage", filename);
        Err(StorageError::Unsupported {
            mode: StorageMode::ObjectStorage,
            operation: "delete",
        })
    }
}
