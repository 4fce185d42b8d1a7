//! ============================================================================
//! Studio Configuration - Resolved once, shared by reference
//! ============================================================================
//! Reads environment variables (after `.env` is loaded by the binary) into a
//! single `StudioConfig`. The storage mode is computed here and nowhere else,
//! so the server and the client always agree on the same inputs.
//! ============================================================================

use std::path::PathBuf;
use tracing::info;

use crate::types::StorageMode;

pub const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_IMAGE_MODEL: &str = "gpt-image-1";
pub const DEFAULT_COMPLETION_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_S3_REGION: &str = "us-west-1";
pub const DEFAULT_KEY_PREFIX: &str = "dreamImage";
pub const DEFAULT_OUTPUT_DIR: &str = "generated-images";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000";

/// Inputs that decide the storage mode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageInputs {
    /// Raw explicit override; unrecognised values are ignored
    pub explicit: Option<String>,
    /// Running on a platform without a writable disk (e.g. `VERCEL=1`)
    pub platform_constrained: bool,
    /// Access key, secret and bucket are all present
    pub object_storage_credentials: bool,
}

/// Pick exactly one storage mode.
/// Precedence: explicit override > object-storage credentials > platform
/// constraint > filesystem.
pub fn resolve_storage_mode(inputs: &StorageInputs) -> StorageMode {
    if let Some(mode) = inputs.explicit.as_deref().and_then(StorageMode::parse) {
        return mode;
    }
    if inputs.object_storage_credentials {
        return StorageMode::ObjectStorage;
    }
    if inputs.platform_constrained {
        return StorageMode::EmbeddedDb;
    }
    StorageMode::Filesystem
}

/// Upstream image-generation provider settings
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub image_model: String,
    pub completion_model: String,
}

/// S3-compatible object storage credentials
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    /// e.g. `https://oss-cn-hangzhou.aliyuncs.com`; defaults to AWS for the region
    pub endpoint: Option<String>,
    pub region: String,
}

/// Where object-storage images are publicly reachable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicUrlSettings {
    pub public_domain: Option<String>,
    pub key_prefix: String,
}

#[derive(Debug, Clone)]
pub struct StudioConfig {
    pub provider: ProviderSettings,
    pub app_password: Option<String>,
    pub storage_inputs: StorageInputs,
    pub storage_mode: StorageMode,
    pub s3: Option<S3Settings>,
    pub public_urls: PublicUrlSettings,
    pub output_dir: PathBuf,
    pub bind_addr: String,
    /// Cap on concurrent provider calls; `None` leaves them unbounded
    pub max_in_flight: Option<usize>,
    pub server_url: String,
    pub db_path: Option<PathBuf>,
}

impl StudioConfig {
    /// Build from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let provider = ProviderSettings {
            api_key: get("OPENAI_API_KEY"),
            base_url: get("OPENAI_API_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            image_model: get("OPENAI_IMAGE_MODEL").unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
            completion_model: get("OPENAI_COMPLETION_MODEL")
                .unwrap_or_else(|| DEFAULT_COMPLETION_MODEL.to_string()),
        };

        let s3 = match (get("S3_ACCESS_KEY_ID"), get("S3_SECRET_ACCESS_KEY"), get("S3_BUCKET")) {
            (Some(access_key_id), Some(secret_access_key), Some(bucket)) => Some(S3Settings {
                access_key_id,
                secret_access_key,
                bucket,
                endpoint: get("S3_ENDPOINT").map(|e| e.trim_end_matches('/').to_string()),
                region: get("S3_REGION").unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
            }),
            _ => None,
        };

        let storage_inputs = StorageInputs {
            explicit: get("NEXT_PUBLIC_IMAGE_STORAGE_MODE").or_else(|| get("IMAGE_STORAGE_MODE")),
            platform_constrained: get("VERCEL").as_deref() == Some("1"),
            object_storage_credentials: s3.is_some(),
        };
        let storage_mode = resolve_storage_mode(&storage_inputs);

        let public_urls = PublicUrlSettings {
            public_domain: get("S3_PUBLIC_DOMAIN")
                .or_else(|| get("NEXT_PUBLIC_OSS_DOMAIN"))
                .map(|d| d.trim_end_matches('/').to_string()),
            key_prefix: get("S3_KEY_PREFIX")
                .map(|p| p.trim_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
        };

        Self {
            provider,
            app_password: get("APP_PASSWORD"),
            storage_inputs,
            storage_mode,
            s3,
            public_urls,
            output_dir: get("STUDIO_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            bind_addr: get("STUDIO_BIND").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            max_in_flight: get("STUDIO_MAX_IN_FLIGHT")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0),
            server_url: get("STUDIO_SERVER_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string()),
            db_path: get("STUDIO_DB_PATH").map(PathBuf::from),
        }
    }

    pub fn password_required(&self) -> bool {
        self.app_password.is_some()
    }

    /// Log the resolution inputs once at startup
    pub fn log_summary(&self) {
        info!(
            "Effective image storage mode: {} (explicit: {}, constrained platform: {}, object storage: {})",
            self.storage_mode,
            self.storage_inputs.explicit.as_deref().unwrap_or("unset"),
            self.storage_inputs.platform_constrained,
            if self.s3.is_some() { "available" } else { "unavailable" }
        );
        if self.password_required() {
            info!("Password protection enabled");
        }
        match self.max_in_flight {
            Some(limit) => info!("Provider calls limited to {} in flight", limit),
            None => info!("Provider calls are not admission-controlled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> StudioConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        StudioConfig::from_lookup(|key| env.get(key).cloned())
    }

    const S3_CREDS: [(&str, &str); 3] = [
        ("S3_ACCESS_KEY_ID", "AKID"),
        ("S3_SECRET_ACCESS_KEY", "secret"),
        ("S3_BUCKET", "bucket"),
    ];

    #[test]
    fn test_default_is_filesystem() {
        let config = config_from(&[]);
        assert_eq!(config.storage_mode, StorageMode::Filesystem);
        assert!(!config.password_required());
        assert_eq!(config.provider.base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.public_urls.key_prefix, DEFAULT_KEY_PREFIX);
    }

    #[test]
    fn test_explicit_override_wins() {
        let mut pairs = S3_CREDS.to_vec();
        pairs.push(("VERCEL", "1"));
        pairs.push(("NEXT_PUBLIC_IMAGE_STORAGE_MODE", "fs"));
        assert_eq!(config_from(&pairs).storage_mode, StorageMode::Filesystem);
    }

    #[test]
    fn test_credentials_beat_platform_constraint() {
        let mut pairs = S3_CREDS.to_vec();
        pairs.push(("VERCEL", "1"));
        assert_eq!(config_from(&pairs).storage_mode, StorageMode::ObjectStorage);
    }

    #[test]
    fn test_platform_constraint_selects_embedded_db() {
        assert_eq!(config_from(&[("VERCEL", "1")]).storage_mode, StorageMode::EmbeddedDb);
        assert_eq!(config_from(&[("VERCEL", "0")]).storage_mode, StorageMode::Filesystem);
    }

    #[test]
    fn test_partial_credentials_are_ignored() {
        let config = config_from(&[("S3_ACCESS_KEY_ID", "AKID"), ("S3_BUCKET", "bucket")]);
        assert!(config.s3.is_none());
        assert_eq!(config.storage_mode, StorageMode::Filesystem);
    }

    #[test]
    fn test_unknown_explicit_mode_falls_through() {
        let config = config_from(&[("NEXT_PUBLIC_IMAGE_STORAGE_MODE", "memory"), ("VERCEL", "1")]);
        assert_eq!(config.storage_mode, StorageMode::EmbeddedDb);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let explicit_values = [None, Some("fs"), Some("indexeddb"), Some("s3"), Some("bogus")];
        for explicit in explicit_values {
            for platform_constrained in [false, true] {
                for object_storage_credentials in [false, true] {
                    let inputs = StorageInputs {
                        explicit: explicit.map(String::from),
                        platform_constrained,
                        object_storage_credentials,
                    };
                    let first = resolve_storage_mode(&inputs);
                    for _ in 0..5 {
                        assert_eq!(resolve_storage_mode(&inputs.clone()), first);
                    }
                }
            }
        }
    }

    #[test]
    fn test_empty_values_count_as_unset() {
        let config = config_from(&[("APP_PASSWORD", "  "), ("OPENAI_API_KEY", "")]);
        assert!(!config.password_required());
        assert!(config.provider.api_key.is_none());
    }

    #[test]
    fn test_public_domain_aliases_and_trimming() {
        let config = config_from(&[
            ("NEXT_PUBLIC_OSS_DOMAIN", "https://cdn.example.com/"),
            ("S3_KEY_PREFIX", "/images/"),
        ]);
        assert_eq!(
            config.public_urls.public_domain.as_deref(),
            Some("https://cdn.example.com")
        );
        assert_eq!(config.public_urls.key_prefix, "images");
    }

    #[test]
    fn test_max_in_flight_parsing() {
        assert_eq!(config_from(&[("STUDIO_MAX_IN_FLIGHT", "4")]).max_in_flight, Some(4));
        assert_eq!(config_from(&[("STUDIO_MAX_IN_FLIGHT", "0")]).max_in_flight, None);
        assert_eq!(config_from(&[("STUDIO_MAX_IN_FLIGHT", "many")]).max_in_flight, None);
    }
}
