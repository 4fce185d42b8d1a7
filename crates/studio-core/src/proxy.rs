//! ============================================================================
//! Generation Proxy - Server-side request handling
//! ============================================================================
//! Validates submissions, calls the image provider, and persists the results
//! according to the effective storage mode:
//! - fs: written to the output directory, served from `/api/image/<f>`
//! - s3: uploaded under `<prefix>/<f>`, returned as a public URL
//! - indexeddb: nothing persisted here, the client stores the bytes
//!
//! Also backs the auxiliary routes (serve, redirect, delete, source upload).
//! ============================================================================

use base64::{engine::general_purpose::STANDARD, Engine};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, error, info, warn};

use crate::auth::{AuthError, PasswordGate};
use crate::config::StudioConfig;
use crate::provider::{EditParams, GenerateParams, ImageProvider, ProviderError, ProviderImage};
use crate::storage::{
    content_type_for, validate_filename, FilesystemBackend, ImageBackend, ObjectStorageBackend, StorageError,
};
use crate::types::{
    AuthStatus, Background, DeleteImagesRequest, DeleteImagesResponse, DeleteResult, GenerationMode,
    GenerationRequest, GenerationResponse, ImageResult, Moderation, OutputFormat, Quality, StorageMode,
    UploadSourceResponse, UploadedImage,
};

/// Upper bound on images per request
pub const MAX_IMAGES_PER_REQUEST: u32 = 10;
pub const DEFAULT_SIZE: &str = "1024x1024";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Server configuration error: API key not found.")]
    MissingApiKey,
    #[error("{0}")]
    Configuration(String),
    #[error(transparent)]
    Unauthorized(#[from] AuthError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    /// Provider failure relayed with its own status
    #[error("{message}")]
    Provider { status: u16, message: String },
    #[error("{0}")]
    Storage(String),
    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::BadRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::Provider { status, .. } => *status,
            Self::MissingApiKey | Self::Configuration(_) | Self::Storage(_) | Self::Internal(_) => 500,
        }
    }
}

impl From<ProviderError> for ProxyError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::MissingApiKey => Self::MissingApiKey,
            other => Self::Provider {
                status: other.status_code(),
                message: other.to_string(),
            },
        }
    }
}

impl From<StorageError> for ProxyError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::InvalidFilename(_) => Self::BadRequest("Invalid filename".into()),
            StorageError::NotConfigured(msg) => Self::Configuration(msg),
            other => Self::Storage(other.to_string()),
        }
    }
}

/// What a submission produced
#[derive(Debug)]
pub enum ProxyOutcome {
    Images(GenerationResponse),
    /// Provider completion JSON, relayed unchanged
    Completion(serde_json::Value),
}

pub struct GenerationProxy {
    config: Arc<StudioConfig>,
    provider: Option<ImageProvider>,
    gate: PasswordGate,
    filesystem: FilesystemBackend,
    object: Option<ObjectStorageBackend>,
    limiter: Option<Semaphore>,
}

impl GenerationProxy {
    pub fn new(config: Arc<StudioConfig>) -> Result<Self, ProxyError> {
        let provider = match ImageProvider::new(&config.provider) {
            Ok(provider) => Some(provider),
            Err(ProviderError::MissingApiKey) => {
                warn!("OPENAI_API_KEY is not set; image requests will fail");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let object = match &config.s3 {
            Some(settings) => Some(ObjectStorageBackend::new(settings, config.public_urls.clone())?),
            None => None,
        };
        if config.storage_mode == StorageMode::ObjectStorage && object.is_none() {
            warn!("Storage mode is s3 but object storage credentials are incomplete");
        }

        Ok(Self {
            gate: PasswordGate::new(config.app_password.as_deref()),
            filesystem: FilesystemBackend::new(config.output_dir.clone()),
            limiter: config.max_in_flight.map(Semaphore::new),
            provider,
            object,
            config,
        })
    }

    pub fn config(&self) -> &StudioConfig {
        &self.config
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.config.storage_mode
    }

    pub fn filesystem(&self) -> &FilesystemBackend {
        &self.filesystem
    }

    pub fn auth_status(&self) -> AuthStatus {
        AuthStatus {
            password_required: self.gate.is_required(),
            storage_mode: self.storage_mode(),
        }
    }

    pub fn check_password(&self, password_hash: Option<&str>) -> Result<(), ProxyError> {
        Ok(self.gate.check(password_hash)?)
    }

    /// Checks that run before the request body is parsed
    pub async fn preflight(&self) -> Result<&ImageProvider, ProxyError> {
        let provider = self.provider.as_ref().ok_or(ProxyError::MissingApiKey)?;
        if self.storage_mode() == StorageMode::Filesystem {
            self.filesystem.ensure_dir().await.map_err(|e| {
                error!("Error creating output directory {}: {}", self.filesystem.dir().display(), e);
                ProxyError::Configuration("Failed to create image output directory.".into())
            })?;
        }
        Ok(provider)
    }

    async fn admit(&self) -> Result<Option<SemaphorePermit<'_>>, ProxyError> {
        match &self.limiter {
            Some(limiter) => {
                let permit = limiter
                    .acquire()
                    .await
                    .map_err(|e| ProxyError::Internal(format!("Admission control closed: {}", e)))?;
                Ok(Some(permit))
            }
            None => Ok(None),
        }
    }

    /// Handle one `/api/images` submission
    pub async fn handle(&self, request: GenerationRequest) -> Result<ProxyOutcome, ProxyError> {
        let provider = self.preflight().await?;
        self.check_password(request.password_hash.as_deref())?;

        let (Some(mode), Some(prompt)) = (
            request.mode.as_deref().filter(|m| !m.is_empty()),
            request.prompt.clone().filter(|p| !p.is_empty()),
        ) else {
            return Err(ProxyError::BadRequest(
                "Missing required parameters: mode and prompt".into(),
            ));
        };

        let mut mode = GenerationMode::parse(mode);
        if !request.images.is_empty() {
            mode = Some(GenerationMode::Edit);
        }
        let mode = mode.ok_or_else(|| ProxyError::BadRequest("Invalid mode specified".into()))?;

        info!(
            "Mode: {}, Prompt: {}...",
            mode.as_str(),
            prompt.chars().take(50).collect::<String>()
        );

        let n = parse_n(request.n.as_deref());
        let output_format = request
            .output_format
            .as_deref()
            .and_then(OutputFormat::parse)
            .unwrap_or_default();

        let _permit = self.admit().await?;

        let result = match mode {
            GenerationMode::Generate => {
                let params = GenerateParams {
                    prompt,
                    n,
                    size: request.size.clone().unwrap_or_else(|| DEFAULT_SIZE.to_string()),
                    quality: parse_or_default(request.quality.as_deref(), Quality::parse),
                    output_compression: parse_compression(output_format, request.output_compression.as_deref()),
                    output_format,
                    background: parse_or_default(request.background.as_deref(), Background::parse),
                    moderation: parse_or_default(request.moderation.as_deref(), Moderation::parse),
                };
                provider.generate(&params).await?
            }
            GenerationMode::Edit => {
                if request.images.is_empty() {
                    return Err(ProxyError::BadRequest("No image file provided for editing.".into()));
                }
                let params = EditParams {
                    prompt,
                    images: request.images,
                    mask: request.mask,
                    n,
                    size: request.size.filter(|s| s != "auto" && !s.is_empty()),
                    quality: request
                        .quality
                        .as_deref()
                        .and_then(Quality::parse)
                        .filter(|q| *q != Quality::Auto),
                };
                provider.edit(params).await?
            }
            GenerationMode::Completion => {
                let size = request.size.unwrap_or_else(|| DEFAULT_SIZE.to_string());
                let value = provider.complete(&prompt, n, &size).await?;
                return Ok(ProxyOutcome::Completion(value));
            }
        };

        if result.data.is_empty() {
            error!("Empty image data received from provider");
            return Err(ProxyError::Internal("Failed to retrieve image data from API.".into()));
        }

        let images = self.persist_batch(provider, result.data, output_format).await?;
        info!("All images processed. Mode: {}", self.storage_mode());

        Ok(ProxyOutcome::Images(GenerationResponse {
            images,
            usage: result.usage,
            storage_mode: self.storage_mode(),
        }))
    }

    fn object_backend(&self) -> Result<&ObjectStorageBackend, ProxyError> {
        self.object
            .as_ref()
            .ok_or_else(|| ProxyError::Configuration("Object storage is not configured.".into()))
    }

    async fn persist_batch(
        &self,
        provider: &ImageProvider,
        data: Vec<ProviderImage>,
        output_format: OutputFormat,
    ) -> Result<Vec<ImageResult>, ProxyError> {
        let batch_ts = chrono::Utc::now().timestamp_millis();
        let mut results = Vec::with_capacity(data.len());
        for (index, image) in data.into_iter().enumerate() {
            let filename = format!("{}-{}.{}", batch_ts, index, output_format.as_str());
            results.push(self.persist_one(provider, image, filename, output_format).await?);
        }
        Ok(results)
    }

    async fn persist_one(
        &self,
        provider: &ImageProvider,
        image: ProviderImage,
        filename: String,
        output_format: OutputFormat,
    ) -> Result<ImageResult, ProxyError> {
        let mut result = ImageResult {
            filename: filename.clone(),
            b64_json: None,
            url: None,
            path: None,
            output_format: output_format.as_str().to_string(),
            original: false,
        };
        let content_type = output_format.mime_type();

        match (image.b64_json, image.url) {
            (Some(b64), _) => {
                let bytes = STANDARD
                    .decode(b64.as_bytes())
                    .map_err(|e| ProxyError::Internal(format!("Failed to decode base64 image: {}", e)))?;
                match self.storage_mode() {
                    StorageMode::Filesystem => {
                        result.path = Some(self.filesystem.put(&filename, &bytes, content_type).await?);
                    }
                    StorageMode::ObjectStorage => {
                        let url = self
                            .object_backend()?
                            .put(&filename, &bytes, content_type)
                            .await
                            .map_err(|e| {
                                error!("Error uploading to object storage: {}", e);
                                ProxyError::Storage(format!("Failed to upload image to S3: {}", e))
                            })?;
                        result.url = Some(url);
                    }
                    StorageMode::EmbeddedDb => {}
                }
                result.b64_json = Some(b64);
            }
            (None, Some(url)) => {
                debug!("Image {} provided as URL: {}", filename, url);
                match self.storage_mode() {
                    StorageMode::Filesystem => {
                        let bytes = provider.download(&url).await.map_err(|e| {
                            ProxyError::Storage(format!("Failed to download image from URL: {}", e))
                        })?;
                        result.path = Some(self.filesystem.put(&filename, &bytes, content_type).await?);
                        result.url = Some(url);
                    }
                    StorageMode::ObjectStorage => match self.rehost(provider, &url, &filename, content_type).await {
                        Ok(hosted) => result.url = Some(hosted),
                        Err(e) => {
                            warn!("Re-hosting {} failed, returning the original URL: {}", filename, e);
                            result.url = Some(url);
                            result.original = true;
                        }
                    },
                    StorageMode::EmbeddedDb => result.url = Some(url),
                }
            }
            (None, None) => {
                error!("Image data for {} has neither b64_json nor url", filename);
                return Err(ProxyError::Internal(format!(
                    "Image data for {} is missing both base64 data and URL.",
                    filename
                )));
            }
        }

        Ok(result)
    }

    async fn rehost(
        &self,
        provider: &ImageProvider,
        url: &str,
        filename: &str,
        content_type: &str,
    ) -> Result<String, ProxyError> {
        let bytes = provider.download(url).await?;
        Ok(self.object_backend()?.put(filename, &bytes, content_type).await?)
    }

    // ========================================================================
    // Auxiliary routes
    // ========================================================================

    /// Bytes and content type of a filesystem-mode image
    pub async fn read_image(&self, filename: &str) -> Result<(Vec<u8>, &'static str), ProxyError> {
        let bytes = self
            .filesystem
            .read(filename)
            .await?
            .ok_or_else(|| ProxyError::NotFound("Image not found".into()))?;
        Ok((bytes, content_type_for(filename)))
    }

    /// Public object-storage URL for a generated image
    pub async fn object_image_url(&self, filename: &str) -> Result<String, ProxyError> {
        validate_filename(filename)?;
        let fallback;
        let backend = match &self.object {
            Some(backend) => backend,
            None => {
                fallback = ObjectStorageBackend::read_only(self.config.public_urls.clone());
                &fallback
            }
        };
        backend
            .resolve(filename)
            .await?
            .ok_or_else(|| ProxyError::Configuration("Object storage public domain is not configured.".into()))
    }

    /// Delete server-held images; per-file outcome
    pub async fn delete_images(&self, request: DeleteImagesRequest) -> Result<DeleteImagesResponse, ProxyError> {
        self.check_password(request.password_hash.as_deref())?;
        if request.filenames.is_empty() {
            return Err(ProxyError::BadRequest("No filenames provided".into()));
        }

        let backend: Box<dyn ImageBackend + '_> = match self.storage_mode() {
            StorageMode::Filesystem => Box::new(self.filesystem.clone()),
            StorageMode::ObjectStorage => Box::new(
                self.object
                    .clone()
                    .unwrap_or_else(|| ObjectStorageBackend::read_only(self.config.public_urls.clone())),
            ),
            StorageMode::EmbeddedDb => {
                return Err(ProxyError::BadRequest(
                    "Images are stored client-side in indexeddb mode".into(),
                ))
            }
        };

        let mut results = Vec::with_capacity(request.filenames.len());
        for filename in request.filenames {
            let outcome = match backend.delete(&filename).await {
                Ok(true) => Ok(()),
                Ok(false) => Err("File not found".to_string()),
                Err(e) => Err(e.to_string()),
            };
            match outcome {
                Ok(()) => {
                    info!("Deleted image: {}", filename);
                    results.push(DeleteResult {
                        filename,
                        success: true,
                        error: None,
                    });
                }
                Err(message) => {
                    warn!("Could not delete {}: {}", filename, message);
                    results.push(DeleteResult {
                        filename,
                        success: false,
                        error: Some(message),
                    });
                }
            }
        }

        Ok(DeleteImagesResponse {
            success: results.iter().all(|r| r.success),
            results,
        })
    }

    /// Upload an edit source image to object storage under its own name
    pub async fn upload_source_image(
        &self,
        filename: Option<String>,
        file: Option<UploadedImage>,
        password_hash: Option<&str>,
    ) -> Result<UploadSourceResponse, ProxyError> {
        self.check_password(password_hash)?;
        let backend = self.object_backend()?;
        let (Some(filename), Some(file)) = (filename.filter(|f| !f.is_empty()), file) else {
            return Err(ProxyError::BadRequest("Missing required fields: file or filename".into()));
        };
        validate_filename(&filename)?;

        let content_type = if file.content_type.is_empty() || file.content_type == "application/octet-stream" {
            content_type_for(&filename).to_string()
        } else {
            file.content_type.clone()
        };

        let url = backend
            .put_key(&filename, &file.bytes, &content_type)
            .await
            .map_err(|e| ProxyError::Storage(format!("Failed to upload source image to S3: {}", e)))?;

        info!("Uploaded source image {} to object storage", filename);
        Ok(UploadSourceResponse {
            success: true,
            filename,
            url,
        })
    }
}

/// `n` clamped to 1..=10; anything unparsable counts as 1
pub fn parse_n(raw: Option<&str>) -> u32 {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|n| *n != 0)
        .unwrap_or(1)
        .clamp(1, MAX_IMAGES_PER_REQUEST as i64) as u32
}

/// Compression only applies to lossy formats and must be in 0..=100
pub fn parse_compression(format: OutputFormat, raw: Option<&str>) -> Option<u8> {
    if !format.supports_compression() {
        return None;
    }
    raw.and_then(|v| v.trim().parse::<u8>().ok()).filter(|c| *c <= 100)
}

fn parse_or_default<T: Default>(raw: Option<&str>, parse: fn(&str) -> Option<T>) -> T {
    raw.and_then(parse).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::sha256_hex;
    use std::collections::HashMap;

    fn proxy_with(pairs: &[(&str, &str)], output_dir: &std::path::Path) -> GenerationProxy {
        let mut env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.insert("STUDIO_OUTPUT_DIR".into(), output_dir.display().to_string());
        let config = StudioConfig::from_lookup(|key| env.get(key).cloned());
        GenerationProxy::new(Arc::new(config)).unwrap()
    }

    fn request(mode: &str, prompt: &str) -> GenerationRequest {
        GenerationRequest {
            mode: Some(mode.into()),
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_n_clamps() {
        assert_eq!(parse_n(None), 1);
        assert_eq!(parse_n(Some("abc")), 1);
        assert_eq!(parse_n(Some("0")), 1);
        assert_eq!(parse_n(Some("-4")), 1);
        assert_eq!(parse_n(Some("3")), 3);
        assert_eq!(parse_n(Some("50")), 10);
    }

    #[test]
    fn test_parse_compression_only_for_lossy_formats() {
        assert_eq!(parse_compression(OutputFormat::Png, Some("50")), None);
        assert_eq!(parse_compression(OutputFormat::Jpeg, Some("50")), Some(50));
        assert_eq!(parse_compression(OutputFormat::Webp, Some("101")), None);
        assert_eq!(parse_compression(OutputFormat::Webp, Some("x")), None);
        assert_eq!(parse_compression(OutputFormat::Jpeg, None), None);
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(ProxyError::MissingApiKey.status_code(), 500);
        assert_eq!(ProxyError::Unauthorized(AuthError::MissingHash).status_code(), 401);
        assert_eq!(ProxyError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(
            ProxyError::from(ProviderError::Api {
                status: 429,
                message: "slow down".into()
            })
            .status_code(),
            429
        );
        assert_eq!(
            ProxyError::from(StorageError::InvalidFilename("..".into())).status_code(),
            400
        );
    }

    #[tokio::test]
    async fn test_missing_api_key_checked_first() {
        let tmp = tempfile::tempdir().unwrap();
        let proxy = proxy_with(&[("APP_PASSWORD", "pw")], tmp.path());
        let err = proxy.handle(GenerationRequest::default()).await.unwrap_err();
        assert!(matches!(err, ProxyError::MissingApiKey));
        assert_eq!(err.to_string(), "Server configuration error: API key not found.");
    }

    #[tokio::test]
    async fn test_password_checked_before_parameters() {
        let tmp = tempfile::tempdir().unwrap();
        let proxy = proxy_with(&[("OPENAI_API_KEY", "sk-test"), ("APP_PASSWORD", "pw")], tmp.path());

        let err = proxy.handle(GenerationRequest::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "Unauthorized: Missing password hash.");

        let mut wrong = request("generate", "a cat");
        wrong.password_hash = Some(sha256_hex("nope"));
        let err = proxy.handle(wrong).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
        assert_eq!(err.to_string(), "Unauthorized: Invalid password.");
    }

    #[tokio::test]
    async fn test_parameter_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let proxy = proxy_with(&[("OPENAI_API_KEY", "sk-test")], tmp.path());

        let err = proxy.handle(request("generate", "")).await.unwrap_err();
        assert_eq!(err.to_string(), "Missing required parameters: mode and prompt");

        let err = proxy.handle(request("variation", "a cat")).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.to_string(), "Invalid mode specified");

        let err = proxy.handle(request("edit", "a cat")).await.unwrap_err();
        assert_eq!(err.to_string(), "No image file provided for editing.");
    }

    #[tokio::test]
    async fn test_filesystem_preflight_creates_output_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("generated-images");
        let proxy = proxy_with(&[("OPENAI_API_KEY", "sk-test")], &out);
        proxy.preflight().await.unwrap();
        assert!(out.is_dir());
    }

    #[tokio::test]
    async fn test_read_image_rejects_traversal_and_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let proxy = proxy_with(&[], tmp.path());
        assert_eq!(proxy.read_image("../secret").await.unwrap_err().status_code(), 400);
        assert_eq!(proxy.read_image("missing.png").await.unwrap_err().status_code(), 404);

        tokio::fs::write(tmp.path().join("1-0.webp"), b"img").await.unwrap();
        let (bytes, content_type) = proxy.read_image("1-0.webp").await.unwrap();
        assert_eq!(bytes, b"img");
        assert_eq!(content_type, "image/webp");
    }

    #[tokio::test]
    async fn test_object_image_url_uses_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let proxy = proxy_with(&[("S3_PUBLIC_DOMAIN", "https://cdn.example.com")], tmp.path());
        assert_eq!(
            proxy.object_image_url("1-0.png").await.unwrap(),
            "https://cdn.example.com/dreamImage/1-0.png"
        );
        assert_eq!(proxy.object_image_url("/etc").await.unwrap_err().status_code(), 400);
    }

    #[tokio::test]
    async fn test_delete_images_reports_per_file() {
        let tmp = tempfile::tempdir().unwrap();
        let proxy = proxy_with(&[], tmp.path());
        tokio::fs::write(tmp.path().join("a.png"), b"a").await.unwrap();

        let response = proxy
            .delete_images(DeleteImagesRequest {
                filenames: vec!["a.png".into(), "b.png".into(), "../x".into()],
                password_hash: None,
            })
            .await
            .unwrap();

        assert!(!response.success);
        assert!(response.results[0].success);
        assert_eq!(response.results[1].error.as_deref(), Some("File not found"));
        assert!(!response.results[2].success);
        assert!(!tmp.path().join("a.png").exists());
    }

    #[tokio::test]
    async fn test_upload_source_requires_object_storage() {
        let tmp = tempfile::tempdir().unwrap();
        let proxy = proxy_with(&[], tmp.path());
        let err = proxy
            .upload_source_image(Some("src.png".into()), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn test_auth_status() {
        let tmp = tempfile::tempdir().unwrap();
        let proxy = proxy_with(&[("APP_PASSWORD", "pw"), ("VERCEL", "1")], tmp.path());
        let status = proxy.auth_status();
        assert!(status.password_required);
        assert_eq!(status.storage_mode, StorageMode::EmbeddedDb);
    }
}
