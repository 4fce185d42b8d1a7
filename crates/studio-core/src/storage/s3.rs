//! ============================================================================
//! S3 Client - Public-read uploads to an S3-compatible bucket
//! ============================================================================
//! Signing and transport are handled by `rust-s3`. Virtual-hosted style
//! (`https://<bucket>.<endpoint>/<key>`) against AWS or any S3-compatible
//! endpoint (Aliyun OSS, R2, MinIO). Only the one call the studio needs is
//! exposed: PUT with a public-read ACL.
//! ============================================================================

use ::s3::creds::Credentials;
use ::s3::{Bucket, Region};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Url;
use tracing::{debug, info};

use super::StorageError;
use crate::config::S3Settings;

/// RFC 3986 unreserved characters stay literal; `/` is kept for key paths
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

#[derive(Clone)]
pub struct S3Client {
    bucket: Box<Bucket>,
    scheme: String,
    /// Host including the bucket label and any explicit port
    host: String,
}

impl S3Client {
    pub fn new(settings: &S3Settings) -> Result<Self, StorageError> {
        let endpoint = settings
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", settings.region));
        let endpoint = if endpoint.contains("://") {
            endpoint
        } else {
            format!("https://{}", endpoint)
        };
        let url = Url::parse(&endpoint)
            .map_err(|e| StorageError::NotConfigured(format!("Invalid S3 endpoint {}: {}", endpoint, e)))?;
        let endpoint_host = url
            .host_str()
            .ok_or_else(|| StorageError::NotConfigured(format!("S3 endpoint has no host: {}", endpoint)))?;

        let host = match url.port() {
            Some(port) => format!("{}.{}:{}", settings.bucket, endpoint_host, port),
            None => format!("{}.{}", settings.bucket, endpoint_host),
        };

        let credentials = Credentials::new(
            Some(settings.access_key_id.as_str()),
            Some(settings.secret_access_key.as_str()),
            None,
            None,
            None,
        )
        .map_err(|e| StorageError::NotConfigured(format!("Invalid S3 credentials: {}", e)))?;
        let region = Region::Custom {
            region: settings.region.clone(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        };
        let mut bucket = Bucket::new(&settings.bucket, region, credentials)
            .map_err(|e| StorageError::NotConfigured(format!("Invalid S3 bucket {}: {}", settings.bucket, e)))?;
        bucket.add_header("x-amz-acl", "public-read");

        debug!("S3 client for bucket {} at {}", settings.bucket, host);

        Ok(Self {
            bucket,
            scheme: url.scheme().to_string(),
            host,
        })
    }

    /// Direct bucket URL of an object key
    pub fn object_url(&self, key: &str) -> String {
        format!("{}://{}{}", self.scheme, self.host, canonical_uri(key))
    }

    /// Upload an object readable by anyone
    pub async fn put_object(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), StorageError> {
        // rust-s3 percent-encodes the path itself
        let response = self
            .bucket
            .put_object_with_content_type(format!("/{}", key.trim_start_matches('/')), bytes, content_type)
            .await
            .map_err(|e| StorageError::ObjectStorage(format!("Upload of {} failed: {}", key, e)))?;

        let status = response.status_code();
        if !(200..300).contains(&status) {
            return Err(StorageError::ObjectStorage(format!(
                "Upload of {} failed with status {}",
                key, status
            )));
        }

        info!("Uploaded {} ({} bytes) to bucket {}", key, bytes.len(), self.bucket.name());
        Ok(())
    }
}

/// `/`-prefixed, percent-encoded object path
pub fn canonical_uri(key: &str) -> String {
    let key = key.trim_start_matches('/');
    format!("/{}", utf8_percent_encode(key, KEY_ENCODE_SET))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> S3Settings {
        S3Settings {
            access_key_id: "AKID".into(),
            secret_access_key: "secret".into(),
            bucket: "studio".into(),
            endpoint: None,
            region: "us-west-1".into(),
        }
    }

    #[test]
    fn test_canonical_uri_encoding() {
        assert_eq!(canonical_uri("test$file.text"), "/test%24file.text");
        assert_eq!(canonical_uri("dreamImage/a b.png"), "/dreamImage/a%20b.png");
        assert_eq!(canonical_uri("/leading.png"), "/leading.png");
    }

    #[test]
    fn test_virtual_hosted_urls() {
        let client = S3Client::new(&settings()).unwrap();
        assert_eq!(
            client.object_url("dreamImage/1-0.png"),
            "https://studio.s3.us-west-1.amazonaws.com/dreamImage/1-0.png"
        );

        let custom = S3Client::new(&S3Settings {
            endpoint: Some("http://localhost:9000".into()),
            ..settings()
        })
        .unwrap();
        assert_eq!(custom.object_url("k.png"), "http://studio.localhost:9000/k.png");
    }

    #[test]
    fn test_bare_endpoint_host_defaults_to_https() {
        let client = S3Client::new(&S3Settings {
            endpoint: Some("oss-cn-hangzhou.aliyuncs.com".into()),
            region: "oss-cn-hangzhou".into(),
            ..settings()
        })
        .unwrap();
        assert_eq!(
            client.object_url("k.png"),
            "https://studio.oss-cn-hangzhou.aliyuncs.com/k.png"
        );
    }

    #[test]
    fn test_invalid_endpoint_is_not_configured() {
        let err = S3Client::new(&S3Settings {
            endpoint: Some("http://".into()),
            ..settings()
        })
        .err()
        .unwrap();
        assert!(matches!(err, StorageError::NotConfigured(_)));
    }
}
