//! ============================================================================
//! Core Types for Image Studio
//! ============================================================================
//! Domain records (tasks, history entries, favorites) and the JSON shapes
//! exchanged between the client and the proxy routes.
//! Records stored in redb are bincode-encoded, so they avoid
//! `skip_serializing_if` and self-describing values.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend that persists generated image bytes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StorageMode {
    #[serde(rename = "fs")]
    Filesystem,
    #[serde(rename = "indexeddb")]
    EmbeddedDb,
    #[serde(rename = "s3")]
    ObjectStorage,
}

impl StorageMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "fs" => Some(Self::Filesystem),
            "indexeddb" => Some(Self::EmbeddedDb),
            "s3" => Some(Self::ObjectStorage),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filesystem => "fs",
            Self::EmbeddedDb => "indexeddb",
            Self::ObjectStorage => "s3",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the provider is asked to do
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    Generate,
    Edit,
    Completion,
}

impl GenerationMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "generate" => Some(Self::Generate),
            "edit" => Some(Self::Edit),
            "completion" => Some(Self::Completion),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Edit => "edit",
            Self::Completion => "completion",
        }
    }
}

/// Lifecycle of a single generation attempt
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed and failed tasks never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Auto,
    Low,
    Medium,
    High,
    Standard,
    Hd,
}

impl Quality {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "standard" => Some(Self::Standard),
            "hd" => Some(Self::Hd),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Standard => "standard",
            Self::Hd => "hd",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Background {
    #[default]
    Auto,
    Transparent,
    Opaque,
}

impl Background {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "transparent" => Some(Self::Transparent),
            "opaque" => Some(Self::Opaque),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Transparent => "transparent",
            Self::Opaque => "opaque",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Moderation {
    #[default]
    Auto,
    Low,
}

impl Moderation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "png" => Some(Self::Png),
            "jpeg" | "jpg" => Some(Self::Jpeg),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Webp => "webp",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
        }
    }

    /// Only lossy formats take a compression level
    pub fn supports_compression(&self) -> bool {
        matches!(self, Self::Jpeg | Self::Webp)
    }
}

// ============================================================================
// Client-side Records
// ============================================================================

/// Original upload kept for re-edit workflows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceImageRef {
    pub filename: String,
    #[serde(default)]
    pub s3_url: Option<String>,
}

/// One user-initiated generation or edit attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    /// Submission time, milliseconds since the epoch
    pub timestamp: i64,
    pub prompt: String,
    pub mode: GenerationMode,
    pub status: TaskStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub quality: Quality,
    #[serde(default)]
    pub background: Option<Background>,
    #[serde(default)]
    pub moderation: Option<Moderation>,
    #[serde(rename = "output_format", default)]
    pub output_format: Option<OutputFormat>,
    #[serde(default)]
    pub source_images: Vec<SourceImageRef>,
    #[serde(default)]
    pub source_storage_mode: Option<StorageMode>,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub size: Option<String>,
    /// Set once the task completes and its history entry exists
    #[serde(default)]
    pub history_timestamp: Option<i64>,
}

/// Image reference inside a history entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryImage {
    pub filename: String,
    /// Remote URL, recorded for object-storage results
    #[serde(default)]
    pub url: Option<String>,
}

/// Estimated spend for one batch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CostDetails {
    pub estimated_cost_usd: f64,
    pub text_input_tokens: u64,
    pub image_input_tokens: u64,
    pub image_output_tokens: u64,
}

/// A completed, persisted batch of generated images
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Batch completion time in milliseconds; doubles as the entry key
    pub timestamp: i64,
    pub images: Vec<HistoryImage>,
    pub storage_mode_used: StorageMode,
    pub duration_ms: u64,
    pub quality: Quality,
    pub background: Background,
    pub moderation: Moderation,
    pub prompt: String,
    pub mode: GenerationMode,
    pub cost_details: Option<CostDetails>,
    #[serde(rename = "output_format", default)]
    pub output_format: Option<OutputFormat>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub size: Option<String>,
}

impl HistoryEntry {
    pub fn filenames(&self) -> Vec<String> {
        self.images.iter().map(|img| img.filename.clone()).collect()
    }
}

/// User-curated reference to a history entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteRecord {
    pub id: String,
    pub history_item_timestamp: i64,
    pub added_at: i64,
    #[serde(default)]
    pub note: Option<String>,
}

// ============================================================================
// Wire Types (proxy routes)
// ============================================================================

/// A file part from a multipart submission
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedImage {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Raw `/api/images` submission; every field is validated by the proxy
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub mode: Option<String>,
    pub prompt: Option<String>,
    pub n: Option<String>,
    pub size: Option<String>,
    pub quality: Option<String>,
    pub output_format: Option<String>,
    pub output_compression: Option<String>,
    pub background: Option<String>,
    pub moderation: Option<String>,
    pub images: Vec<UploadedImage>,
    pub mask: Option<UploadedImage>,
    pub password_hash: Option<String>,
}

impl GenerationRequest {
    /// Text fields in multipart order, skipping unset ones
    pub fn text_fields(&self) -> Vec<(&'static str, String)> {
        let fields = [
            ("mode", &self.mode),
            ("prompt", &self.prompt),
            ("n", &self.n),
            ("size", &self.size),
            ("quality", &self.quality),
            ("output_format", &self.output_format),
            ("output_compression", &self.output_compression),
            ("background", &self.background),
            ("moderation", &self.moderation),
            ("passwordHash", &self.password_hash),
        ];
        fields
            .into_iter()
            .filter_map(|(name, value)| value.clone().map(|v| (name, v)))
            .collect()
    }
}

/// Token usage reported by the provider
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub input_tokens_details: Option<InputTokensDetails>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InputTokensDetails {
    #[serde(default)]
    pub text_tokens: u64,
    #[serde(default)]
    pub image_tokens: u64,
}

/// One image in the `/api/images` response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageResult {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub output_format: String,
    /// The provider URL is relayed because re-hosting failed
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub original: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResponse {
    pub images: Vec<ImageResult>,
    #[serde(default)]
    pub usage: Option<Usage>,
    pub storage_mode: StorageMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    pub password_required: bool,
    pub storage_mode: StorageMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteImagesRequest {
    pub filenames: Vec<String>,
    #[serde(default)]
    pub password_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteResult {
    pub filename: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteImagesResponse {
    pub success: bool,
    pub results: Vec<DeleteResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadSourceResponse {
    pub success: bool,
    pub filename: String,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_mode_wire_names() {
        assert_eq!(serde_json::to_string(&StorageMode::Filesystem).unwrap(), "\"fs\"");
        assert_eq!(serde_json::to_string(&StorageMode::EmbeddedDb).unwrap(), "\"indexeddb\"");
        assert_eq!(serde_json::to_string(&StorageMode::ObjectStorage).unwrap(), "\"s3\"");
        assert_eq!(StorageMode::parse(" S3 "), Some(StorageMode::ObjectStorage));
        assert_eq!(StorageMode::parse("memory"), None);
    }

    #[test]
    fn test_task_status_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_history_entry_json_shape() {
        let entry = HistoryEntry {
            timestamp: 1_700_000_000_000,
            images: vec![HistoryImage {
                filename: "1700000000000-0.png".into(),
                url: None,
            }],
            storage_mode_used: StorageMode::Filesystem,
            duration_ms: 1200,
            quality: Quality::Auto,
            background: Background::Auto,
            moderation: Moderation::Auto,
            prompt: "a cat".into(),
            mode: GenerationMode::Generate,
            cost_details: None,
            output_format: Some(OutputFormat::Png),
            task_id: Some("t1".into()),
            n: Some(1),
            size: Some("1024x1024".into()),
        };

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["storageModeUsed"], "fs");
        assert_eq!(json["durationMs"], 1200);
        assert_eq!(json["output_format"], "png");
        assert_eq!(json["taskId"], "t1");
    }

    #[test]
    fn test_image_result_omits_empty_fields() {
        let result = ImageResult {
            filename: "1-0.png".into(),
            b64_json: None,
            url: Some("https://cdn/x.png".into()),
            path: None,
            output_format: "png".into(),
            original: false,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("b64_json").is_none());
        assert!(json.get("original").is_none());
        assert_eq!(json["url"], "https://cdn/x.png");
    }

    #[test]
    fn test_request_text_fields_skip_unset() {
        let request = GenerationRequest {
            mode: Some("generate".into()),
            prompt: Some("a cat".into()),
            password_hash: Some("abc".into()),
            ..Default::default()
        };
        let fields = request.text_fields();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[2], ("passwordHash", "abc".to_string()));
    }
}
