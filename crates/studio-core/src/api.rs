//! ============================================================================
//! Studio API - Client access to the proxy routes
//! ============================================================================
//! `StudioApi` is what the client session talks to. Two implementations:
//! - HttpStudioApi: reqwest against a running studio server
//! - LocalStudioApi: calls a `GenerationProxy` in-process
//! ============================================================================

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::proxy::{GenerationProxy, ProxyError, ProxyOutcome};
use crate::storage::local_image_path;
use crate::types::{
    AuthStatus, DeleteImagesRequest, DeleteImagesResponse, GenerationRequest, GenerationResponse,
    UploadSourceResponse, UploadedImage,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{message}")]
    Status { status: u16, message: String },
    #[error("Failed to reach studio server: {0}")]
    Transport(String),
    #[error("Invalid server response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    fn from_status(status: u16, message: String) -> Self {
        if status == 401 {
            Self::Unauthorized(message)
        } else {
            Self::Status { status, message }
        }
    }
}

impl From<ProxyError> for ApiError {
    fn from(e: ProxyError) -> Self {
        Self::from_status(e.status_code(), e.to_string())
    }
}

#[async_trait]
pub trait StudioApi: Send + Sync {
    /// Generate or edit; the response reports the server's storage mode
    async fn submit(&self, request: GenerationRequest) -> Result<GenerationResponse, ApiError>;

    /// Completion mode; provider JSON passes through untouched
    async fn complete(&self, request: GenerationRequest) -> Result<serde_json::Value, ApiError>;

    async fn auth_status(&self) -> Result<AuthStatus, ApiError>;

    async fn delete_images(
        &self,
        filenames: Vec<String>,
        password_hash: Option<String>,
    ) -> Result<DeleteImagesResponse, ApiError>;

    async fn upload_source_image(
        &self,
        image: UploadedImage,
        password_hash: Option<String>,
    ) -> Result<UploadSourceResponse, ApiError>;

    /// Whether the server still holds a filesystem-mode image
    async fn image_exists(&self, filename: &str) -> Result<bool, ApiError>;

    /// Bytes of a filesystem-mode image, `None` when the server no longer has it
    async fn fetch_image(&self, filename: &str) -> Result<Option<Vec<u8>>, ApiError>;

    /// Where a filesystem-mode image is displayed from
    fn image_url(&self, filename: &str) -> String;
}

// ============================================================================
// HTTP client
// ============================================================================

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Clone)]
pub struct HttpStudioApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStudioApi {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn form(request: GenerationRequest) -> Result<Form, ApiError> {
        let mut form = Form::new();
        for (name, value) in request.text_fields() {
            form = form.text(name, value);
        }
        for (index, image) in request.images.into_iter().enumerate() {
            form = form.part(format!("image_{}", index), file_part(image)?);
        }
        if let Some(mask) = request.mask {
            form = form.part("mask", file_part(mask)?);
        }
        Ok(form)
    }

    async fn post_form<T: serde::de::DeserializeOwned>(&self, path: &str, form: Form) -> Result<T, ApiError> {
        let response = self
            .client
            .post(self.url(path))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        decode(response).await
    }
}

fn file_part(image: UploadedImage) -> Result<Part, ApiError> {
    Part::bytes(image.bytes)
        .file_name(image.filename)
        .mime_str(&image.content_type)
        .map_err(|e| ApiError::Decode(format!("invalid content type: {}", e)))
}

async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ApiError::Transport(e.to_string()))?;

    if !status.is_success() {
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or_else(|_| format!("API request failed with status {}", status.as_u16()));
        warn!("Studio API error {}: {}", status.as_u16(), message);
        return Err(ApiError::from_status(status.as_u16(), message));
    }

    serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
}

#[async_trait]
impl StudioApi for HttpStudioApi {
    async fn submit(&self, request: GenerationRequest) -> Result<GenerationResponse, ApiError> {
        debug!("Submitting {} request", request.mode.as_deref().unwrap_or("unknown"));
        self.post_form("/api/images", Self::form(request)?).await
    }

    async fn complete(&self, request: GenerationRequest) -> Result<serde_json::Value, ApiError> {
        self.post_form("/api/images", Self::form(request)?).await
    }

    async fn auth_status(&self) -> Result<AuthStatus, ApiError> {
        let response = self
            .client
            .get(self.url("/api/auth-status"))
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        decode(response).await
    }

    async fn delete_images(
        &self,
        filenames: Vec<String>,
        password_hash: Option<String>,
    ) -> Result<DeleteImagesResponse, ApiError> {
        let response = self
            .client
            .post(self.url("/api/image-delete"))
            .json(&DeleteImagesRequest {
                filenames,
                password_hash,
            })
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        decode(response).await
    }

    async fn upload_source_image(
        &self,
        image: UploadedImage,
        password_hash: Option<String>,
    ) -> Result<UploadSourceResponse, ApiError> {
        let mut form = Form::new().text("filename", image.filename.clone());
        if let Some(hash) = password_hash {
            form = form.text("passwordHash", hash);
        }
        form = form.part("file", file_part(image)?);
        self.post_form("/api/upload-source-image", form).await
    }

    async fn image_exists(&self, filename: &str) -> Result<bool, ApiError> {
        let response = self
            .client
            .head(self.image_url(filename))
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(response.status().is_success())
    }

    async fn fetch_image(&self, filename: &str) -> Result<Option<Vec<u8>>, ApiError> {
        let response = self
            .client
            .get(self.image_url(filename))
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ApiError::from_status(
                status.as_u16(),
                format!("Failed to fetch image {} (status {})", filename, status.as_u16()),
            ));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Some(bytes.to_vec()))
    }

    fn image_url(&self, filename: &str) -> String {
        self.url(&local_image_path(filename))
    }
}

// ============================================================================
// In-process client
// ============================================================================

/// Runs the proxy inside the client process
#[derive(Clone)]
pub struct LocalStudioApi {
    proxy: Arc<GenerationProxy>,
}

impl LocalStudioApi {
    pub fn new(proxy: Arc<GenerationProxy>) -> Self {
        Self { proxy }
    }
}

#[async_trait]
impl StudioApi for LocalStudioApi {
    async fn submit(&self, request: GenerationRequest) -> Result<GenerationResponse, ApiError> {
        match self.proxy.handle(request).await? {
            ProxyOutcome::Images(response) => Ok(response),
            ProxyOutcome::Completion(_) => Err(ApiError::Decode(
                "completion result returned for an image request".into(),
            )),
        }
    }

    async fn complete(&self, request: GenerationRequest) -> Result<serde_json::Value, ApiError> {
        match self.proxy.handle(request).await? {
            ProxyOutcome::Completion(value) => Ok(value),
            ProxyOutcome::Images(response) => {
                serde_json::to_value(response).map_err(|e| ApiError::Decode(e.to_string()))
            }
        }
    }

    async fn auth_status(&self) -> Result<AuthStatus, ApiError> {
        Ok(self.proxy.auth_status())
    }

    async fn delete_images(
        &self,
        filenames: Vec<String>,
        password_hash: Option<String>,
    ) -> Result<DeleteImagesResponse, ApiError> {
        Ok(self
            .proxy
            .delete_images(DeleteImagesRequest {
                filenames,
                password_hash,
            })
            .await?)
    }

    async fn upload_source_image(
        &self,
        image: UploadedImage,
        password_hash: Option<String>,
    ) -> Result<UploadSourceResponse, ApiError> {
        Ok(self
            .proxy
            .upload_source_image(Some(image.filename.clone()), Some(image), password_hash.as_deref())
            .await?)
    }

    async fn image_exists(&self, filename: &str) -> Result<bool, ApiError> {
        Ok(self.proxy.read_image(filename).await.is_ok())
    }

    async fn fetch_image(&self, filename: &str) -> Result<Option<Vec<u8>>, ApiError> {
        match self.proxy.read_image(filename).await {
            Ok((bytes, _)) => Ok(Some(bytes)),
            Err(ProxyError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn image_url(&self, filename: &str) -> String {
        local_image_path(filename)
    }
}
