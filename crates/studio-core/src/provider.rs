//! ============================================================================
//! Image Provider - OpenAI-compatible image generation API
//! ============================================================================
//! Handles calls to the upstream provider:
//! - Generate images from text prompts (JSON)
//! - Edit source images with an optional mask (multipart)
//! - Plain text completions, relayed untouched
//! - Download provider-hosted result URLs for re-hosting
//! ============================================================================

use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ProviderSettings;
use crate::types::{Background, Moderation, OutputFormat, Quality, UploadedImage, Usage};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Server configuration error: API key not found.")]
    MissingApiKey,
    /// The provider answered with a non-success status
    #[error("{message}")]
    Api { status: u16, message: String },
    #[error("Failed to reach image provider: {0}")]
    Transport(String),
    #[error("Failed to parse provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// HTTP status to relay to the caller
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Api { status, .. } => *status,
            _ => 500,
        }
    }
}

/// Parameters for a text-to-image request
#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub prompt: String,
    pub n: u32,
    pub size: String,
    pub quality: Quality,
    pub output_format: OutputFormat,
    pub output_compression: Option<u8>,
    pub background: Background,
    pub moderation: Moderation,
}

/// Parameters for an image edit request
#[derive(Debug, Clone)]
pub struct EditParams {
    pub prompt: String,
    pub images: Vec<UploadedImage>,
    pub mask: Option<UploadedImage>,
    pub n: u32,
    /// `None` lets the provider pick (`auto`)
    pub size: Option<String>,
    pub quality: Option<Quality>,
}

/// One returned image: inline bytes, a hosted URL, or both
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderImage {
    pub b64_json: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderImages {
    #[serde(default)]
    pub data: Vec<ProviderImage>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Client for the upstream image API
#[derive(Clone)]
pub struct ImageProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    image_model: String,
    completion_model: String,
}

impl ImageProvider {
    /// Create a provider client; fails without an API key
    pub fn new(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        let api_key = settings.api_key.clone().ok_or(ProviderError::MissingApiKey)?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: settings.base_url.clone(),
            image_model: settings.image_model.clone(),
            completion_model: settings.completion_model.clone(),
        })
    }

    pub async fn generate(&self, params: &GenerateParams) -> Result<ProviderImages, ProviderError> {
        info!(
            "Generating {} image(s): {}...",
            params.n,
            truncate(&params.prompt, 50)
        );

        let request = GenerateRequest {
            model: &self.image_model,
            prompt: &params.prompt,
            n: params.n,
            size: &params.size,
            quality: params.quality.as_str(),
            output_format: params.output_format.as_str(),
            output_compression: params.output_compression,
            background: params.background.as_str(),
            moderation: params.moderation.as_str(),
        };

        let response = self
            .client
            .post(format!("{}/images/generations", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let images: ProviderImages = parse_json(response).await?;
        info!("Provider returned {} image(s)", images.data.len());
        Ok(images)
    }

    pub async fn edit(&self, params: EditParams) -> Result<ProviderImages, ProviderError> {
        info!(
            "Editing {} source image(s) (mask: {}): {}...",
            params.images.len(),
            params.mask.is_some(),
            truncate(&params.prompt, 50)
        );

        let image_field = if params.images.len() > 1 { "image[]" } else { "image" };

        let mut form = Form::new()
            .text("model", self.image_model.clone())
            .text("prompt", params.prompt.clone())
            .text("n", params.n.to_string());
        if let Some(size) = &params.size {
            form = form.text("size", size.clone());
        }
        if let Some(quality) = params.quality {
            form = form.text("quality", quality.as_str().to_string());
        }
        for image in params.images {
            form = form.part(image_field, file_part(image)?);
        }
        if let Some(mask) = params.mask {
            form = form.part("mask", file_part(mask)?);
        }

        let response = self
            .client
            .post(format!("{}/images/edits", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let images: ProviderImages = parse_json(response).await?;
        info!("Provider returned {} edited image(s)", images.data.len());
        Ok(images)
    }

    /// Text completion; the provider JSON is returned as-is
    pub async fn complete(
        &self,
        prompt: &str,
        n: u32,
        size: &str,
    ) -> Result<serde_json::Value, ProviderError> {
        let prompt_map = serde_json::json!({
            "role": "user",
            "prompt": prompt,
            "n": n,
            "size": size,
        });
        let body = serde_json::json!({
            "model": self.completion_model,
            "prompt": prompt_map.to_string(),
        });

        let response = self
            .client
            .post(format!("{}/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        parse_json(response).await
    }

    /// Fetch a provider-hosted image
    pub async fn download(&self, url: &str) -> Result<Vec<u8>, ProviderError> {
        debug!("Downloading provider image: {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: format!("Failed to download image from URL: {}", status),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

// ============================================================================
// Provider API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'a str,
    quality: &'a str,
    output_format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_compression: Option<u8>,
    background: &'a str,
    moderation: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

fn file_part(image: UploadedImage) -> Result<Part, ProviderError> {
    Part::bytes(image.bytes)
        .file_name(image.filename)
        .mime_str(&image.content_type)
        .map_err(|e| ProviderError::Decode(format!("invalid content type: {}", e)))
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ProviderError::Transport(e.to_string()))?;

    if !status.is_success() {
        return Err(ProviderError::Api {
            status: status.as_u16(),
            message: error_message(&body, status.as_u16()),
        });
    }

    serde_json::from_str(&body).map_err(|e| ProviderError::Decode(e.to_string()))
}

/// Pull `error.message` out of a provider error body, falling back to the raw text
fn error_message(body: &str, status: u16) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => envelope.error.message,
        Err(_) if body.trim().is_empty() => format!("Provider request failed with status {}", status),
        Err(_) => body.trim().to_string(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_api_key() {
        let settings = ProviderSettings {
            api_key: None,
            base_url: "http://localhost".into(),
            image_model: "m".into(),
            completion_model: "c".into(),
        };
        assert!(matches!(
            ImageProvider::new(&settings),
            Err(ProviderError::MissingApiKey)
        ));
    }

    #[test]
    fn test_error_message_extraction() {
        let body = r#"{"error":{"message":"Billing hard limit reached","type":"invalid_request_error"}}"#;
        assert_eq!(error_message(body, 400), "Billing hard limit reached");
        assert_eq!(error_message("upstream down", 502), "upstream down");
        assert_eq!(error_message("", 503), "Provider request failed with status 503");
    }

    #[test]
    fn test_status_code_passthrough() {
        let err = ProviderError::Api {
            status: 429,
            message: "slow down".into(),
        };
        assert_eq!(err.status_code(), 429);
        assert_eq!(err.to_string(), "slow down");
        assert_eq!(ProviderError::Transport("x".into()).status_code(), 500);
    }

    #[test]
    fn test_generate_request_skips_compression() {
        let request = GenerateRequest {
            model: "gpt-image-1",
            prompt: "a cat",
            n: 2,
            size: "1024x1024",
            quality: "auto",
            output_format: "png",
            output_compression: None,
            background: "auto",
            moderation: "auto",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("output_compression").is_none());
        assert_eq!(json["n"], 2);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("日本語のプロンプト", 3), "日本語");
        assert_eq!(truncate("short", 50), "short");
    }
}
