use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::{ByteStream, DateTime as SmithyDateTime};
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::config::S3Config;

/// Object metadata key carrying the uploader-supplied filename
const METADATA_ORIGINAL_NAME: &str = "original-name";
/// Object metadata key carrying the upload timestamp
const METADATA_UPLOAD_TIME: &str = "upload-time";
/// Object metadata key tagging which system wrote the object
const METADATA_UPLOADED_BY: &str = "uploaded-by";

const UPLOADER_TAG: &str = "pictor-service";

/// Errors from the object storage layer
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("Failed to read metadata for {key}: {message}")]
    Head { key: String, message: String },

    #[error("Failed to upload {key}: {message}")]
    Upload { key: String, message: String },

    #[error("Failed to list objects under {prefix}: {message}")]
    List { prefix: String, message: String },

    #[error("Failed to presign URL for {key}: {message}")]
    Presign { key: String, message: String },

    #[error("Object storage unavailable: {0}")]
    Unavailable(String),
}

/// Metadata recorded against an uploaded object
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObjectInfo {
    pub file_size: i64,
    pub original_name: Option<String>,
    pub upload_time: Option<DateTime<Utc>>,
}

/// One entry from a bucket listing
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: i64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Capability interface over the image bucket
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket this store operates on
    fn bucket(&self) -> &str;

    /// Fetch size and upload metadata for a stored object
    async fn object_info(&self, key: &str) -> Result<StoredObjectInfo, ObjectStoreError>;

    /// Upload image bytes under the given key, recording the original
    /// filename and upload time as object metadata
    async fn put_image(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
        original_name: &str,
    ) -> Result<(), ObjectStoreError>;

    /// List objects under a key prefix
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectSummary>, ObjectStoreError>;

    /// Generate a presigned GET URL for direct image access
    async fn presign_get(&self, key: &str, expiry: Duration)
        -> Result<String, ObjectStoreError>;

    /// Verify the bucket is reachable
    async fn health_check(&self) -> Result<(), ObjectStoreError>;
}

/// S3-backed object store for uploaded images
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Create a new store against the configured bucket
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "Object store initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn object_info(&self, key: &str) -> Result<StoredObjectInfo, ObjectStoreError> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Head {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        let file_size = response.content_length().unwrap_or(0);
        let metadata = response.metadata();
        let original_name = metadata
            .and_then(|m| m.get(METADATA_ORIGINAL_NAME))
            .cloned();
        let upload_time = metadata
            .and_then(|m| m.get(METADATA_UPLOAD_TIME))
            .and_then(|raw| parse_upload_time(raw));

        Ok(StoredObjectInfo {
            file_size,
            original_name,
            upload_time,
        })
    }

    #[instrument(skip(self, data), fields(key = %key, size_bytes = data.len()))]
    async fn put_image(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
        original_name: &str,
    ) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .metadata(METADATA_ORIGINAL_NAME, original_name)
            .metadata(METADATA_UPLOAD_TIME, Utc::now().to_rfc3339())
            .metadata(METADATA_UPLOADED_BY, UPLOADER_TAG)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Upload {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        debug!(key = %key, "Image uploaded");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectSummary>, ObjectStoreError> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .send()
            .await
            .map_err(|e| ObjectStoreError::List {
                prefix: prefix.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        let objects = response
            .contents()
            .iter()
            .filter_map(|obj| {
                Some(ObjectSummary {
                    key: obj.key()?.to_string(),
                    size: obj.size().unwrap_or(0),
                    last_modified: obj.last_modified().and_then(chrono_from_smithy),
                })
            })
            .collect();

        Ok(objects)
    }

    async fn presign_get(
        &self,
        key: &str,
        expiry: Duration,
    ) -> Result<String, ObjectStoreError> {
        let presigning_config =
            PresigningConfig::expires_in(expiry).map_err(|e| ObjectStoreError::Presign {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| ObjectStoreError::Presign {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(presigned.uri().to_string())
    }

    async fn health_check(&self) -> Result<(), ObjectStoreError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| ObjectStoreError::Unavailable(DisplayErrorContext(&e).to_string()))
    }
}

/// Final path segment of a storage key
pub(crate) fn key_basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Parse an upload-time metadata value. New uploads write RFC 3339;
/// older clients wrote a naive ISO 8601 timestamp without an offset,
/// which is interpreted as UTC.
fn parse_upload_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn chrono_from_smithy(value: &SmithyDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(value.secs(), value.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_upload_time_rfc3339() {
        let parsed = parse_upload_time("2024-03-01T12:30:45Z").unwrap();
        assert_eq!(parsed.hour(), 12);
        assert_eq!(parsed.minute(), 30);

        let with_offset = parse_upload_time("2024-03-01T12:30:45+02:00").unwrap();
        assert_eq!(with_offset.hour(), 10);
    }

    #[test]
    fn test_parse_upload_time_naive_iso() {
        // Python isoformat() output has no offset
        let parsed = parse_upload_time("2024-03-01T12:30:45.123456").unwrap();
        assert_eq!(parsed.hour(), 12);
        assert_eq!(parsed.second(), 45);

        let no_fraction = parse_upload_time("2024-03-01T12:30:45").unwrap();
        assert_eq!(no_fraction.hour(), 12);
    }

    #[test]
    fn test_parse_upload_time_invalid() {
        assert!(parse_upload_time("not-a-timestamp").is_none());
        assert!(parse_upload_time("").is_none());
    }

    #[test]
    fn test_key_basename() {
        assert_eq!(key_basename("uploads/cat.jpg"), "cat.jpg");
        assert_eq!(key_basename("cat.jpg"), "cat.jpg");
        assert_eq!(key_basename("a/b/c.png"), "c.png");
    }

    #[test]
    fn test_chrono_from_smithy() {
        let smithy = SmithyDateTime::from_secs(1_700_000_000);
        let converted = chrono_from_smithy(&smithy).unwrap();
        assert_eq!(converted.timestamp(), 1_700_000_000);
    }
}
