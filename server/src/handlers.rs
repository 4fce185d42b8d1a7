//! Route handlers. Each one parses the HTTP shape and hands off to the proxy.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use tracing::{error, warn};

use studio_core::types::{DeleteImagesRequest, GenerationRequest, UploadedImage};
use studio_core::{ProxyError, ProxyOutcome};

use super::AppState;

/// Proxy errors rendered as `{"error": ...}` with their status
pub(crate) struct AppError(ProxyError);

impl From<ProxyError> for AppError {
    fn from(e: ProxyError) -> Self {
        Self(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Request rejected ({}): {}", status.as_u16(), self.0);
        }
        json_error(status, &self.0.to_string())
    }
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Text fields and file parts of one multipart body
#[derive(Default)]
struct MultipartFields {
    text: HashMap<String, String>,
    files: Vec<(String, UploadedImage)>,
}

impl MultipartFields {
    async fn read(mut multipart: Multipart) -> Result<Self, AppError> {
        let mut fields = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ProxyError::BadRequest(format!("Invalid form data: {}", e)))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match field.file_name().map(str::to_string) {
                Some(filename) => {
                    let content_type = field
                        .content_type()
                        .unwrap_or("application/octet-stream")
                        .to_string();
                    let bytes = field
                        .bytes()
                        .await
                        .map_err(|e| ProxyError::BadRequest(format!("Invalid form data: {}", e)))?;
                    fields.files.push((
                        name,
                        UploadedImage {
                            filename,
                            content_type,
                            bytes: bytes.to_vec(),
                        },
                    ));
                }
                None => {
                    let value = field
                        .text()
                        .await
                        .map_err(|e| ProxyError::BadRequest(format!("Invalid form data: {}", e)))?;
                    fields.text.insert(name, value);
                }
            }
        }
        Ok(fields)
    }

    fn take_text(&mut self, name: &str) -> Option<String> {
        self.text.remove(name)
    }

    fn take_file(&mut self, name: &str) -> Option<UploadedImage> {
        let index = self.files.iter().position(|(field, _)| field == name)?;
        Some(self.files.remove(index).1)
    }

    /// `image_0`, `image_1`, ... in index order
    fn take_images(&mut self) -> Vec<UploadedImage> {
        let mut images: Vec<(usize, UploadedImage)> = Vec::new();
        let mut rest = Vec::with_capacity(self.files.len());
        for (name, file) in self.files.drain(..) {
            match name.strip_prefix("image_").and_then(|i| i.parse::<usize>().ok()) {
                Some(index) => images.push((index, file)),
                None => rest.push((name, file)),
            }
        }
        self.files = rest;
        images.sort_by_key(|(index, _)| *index);
        images.into_iter().map(|(_, file)| file).collect()
    }
}

/// Fallback handler for unmatched routes
pub(crate) async fn handle_not_found() -> Response {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// GET /health
pub(crate) async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "storageMode": state.proxy.storage_mode(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /api/images
pub(crate) async fn handle_images(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    // API key and output directory are checked before the body is read
    state.proxy.preflight().await?;

    let mut form = MultipartFields::read(multipart).await?;
    let request = GenerationRequest {
        mode: form.take_text("mode"),
        prompt: form.take_text("prompt"),
        n: form.take_text("n"),
        size: form.take_text("size"),
        quality: form.take_text("quality"),
        output_format: form.take_text("output_format"),
        output_compression: form.take_text("output_compression"),
        background: form.take_text("background"),
        moderation: form.take_text("moderation"),
        password_hash: form.take_text("passwordHash"),
        images: form.take_images(),
        mask: form.take_file("mask"),
    };

    Ok(match state.proxy.handle(request).await? {
        ProxyOutcome::Images(response) => Json(response).into_response(),
        ProxyOutcome::Completion(value) => Json(value).into_response(),
    })
}

/// GET /api/image/{filename}
pub(crate) async fn handle_image(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    let (bytes, content_type) = state.proxy.read_image(&filename).await?;
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

/// GET /api/s3-image/{filename}
pub(crate) async fn handle_s3_image(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    let url = state.proxy.object_image_url(&filename).await?;
    Ok(Redirect::temporary(&url).into_response())
}

/// POST /api/upload-source-image
pub(crate) async fn handle_upload_source_image(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let mut form = MultipartFields::read(multipart).await?;
    let password_hash = form.take_text("passwordHash");
    let response = state
        .proxy
        .upload_source_image(form.take_text("filename"), form.take_file("file"), password_hash.as_deref())
        .await?;
    Ok(Json(response).into_response())
}

/// POST /api/image-delete
pub(crate) async fn handle_image_delete(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, AppError> {
    let request: DeleteImagesRequest = serde_json::from_slice(&body)
        .map_err(|_| ProxyError::BadRequest("Invalid request body".into()))?;
    let response = state.proxy.delete_images(request).await?;
    Ok(Json(response).into_response())
}

/// GET /api/auth-status
pub(crate) async fn handle_auth_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.proxy.auth_status())
}
