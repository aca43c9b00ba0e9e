//! S3 implementation of the RemoteStore trait.
//!
//! This module stores the sync snapshot in S3-compatible storage:
//! - AWS S3
//! - Cloudflare R2 (via custom endpoint, region "auto")
//! - MinIO (via custom endpoint)
//! - Other S3-compatible services

use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use serde_json::Value;

use crate::config::S3Settings;
use crate::remote::{prefixed_key, RemoteError, RemoteStore};

/// Configuration for the S3 remote store.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// Region (e.g., "us-east-1"; R2 uses "auto")
    pub region: String,
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Optional path prefix for all objects
    pub prefix: Option<String>,
    /// Optional custom endpoint for S3-compatible services
    /// (e.g., "https://<account>.r2.cloudflarestorage.com")
    pub endpoint: Option<String>,
}

impl From<&S3Settings> for S3Config {
    fn from(settings: &S3Settings) -> Self {
        let non_empty = |s: &str| {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        };
        Self {
            bucket: settings.bucket.clone(),
            region: non_empty(&settings.region).unwrap_or_else(|| "auto".to_string()),
            access_key_id: settings.access_key_id.clone(),
            secret_access_key: settings.secret_access_key.clone(),
            prefix: settings.prefix.as_deref().and_then(non_empty),
            endpoint: non_empty(&settings.endpoint),
        }
    }
}

/// S3-based snapshot store.
pub struct S3RemoteStore {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3RemoteStore {
    /// Create a new S3 remote store from configuration.
    ///
    /// # Returns
    /// * `Ok(S3RemoteStore)` - Ready to use store
    /// * `Err(RemoteError)` - If configuration is invalid
    pub fn new(config: S3Config) -> Result<Self, RemoteError> {
        if config.bucket.is_empty() {
            return Err(RemoteError::Config("bucket name is required".to_string()));
        }
        if config.access_key_id.is_empty() {
            return Err(RemoteError::Config("access_key_id is required".to_string()));
        }
        if config.secret_access_key.is_empty() {
            return Err(RemoteError::Config("secret_access_key is required".to_string()));
        }

        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None, // session token
            None, // expiration
            "memo-config",
        );

        let region = Region::new(config.region.clone());

        let mut sdk_config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(region);

        if let Some(endpoint) = &config.endpoint {
            sdk_config_builder = sdk_config_builder
                .endpoint_url(endpoint)
                .force_path_style(true); // Required for most S3-compatible services
        }

        let client = Client::from_conf(sdk_config_builder.build());

        Ok(Self {
            client,
            bucket: config.bucket,
            prefix: config.prefix,
        })
    }

    /// Build a store from the persisted S3 settings.
    pub fn from_settings(settings: &S3Settings) -> Result<Self, RemoteError> {
        if !settings.is_configured() {
            return Err(RemoteError::Config(
                "S3 storage is not enabled or incomplete".to_string(),
            ));
        }
        Self::new(S3Config::from(settings))
    }

    fn full_key(&self, key: &str) -> String {
        prefixed_key(self.prefix.as_deref(), key)
    }
}

impl RemoteStore for S3RemoteStore {
    async fn download_json(&self, key: &str) -> Result<Option<Value>, RemoteError> {
        let full_key = self.full_key(key);

        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false);
                if not_found {
                    tracing::debug!(key = %full_key, "No snapshot stored yet");
                    return Ok(None);
                }
                return Err(RemoteError::Download(format!("S3 get failed: {}", err)));
            }
        };

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| RemoteError::Network(format!("Failed to read S3 body: {}", e)))?
            .into_bytes();

        let value = serde_json::from_slice(&bytes)?;

        tracing::debug!(
            key = %full_key,
            bucket = %self.bucket,
            size_bytes = bytes.len(),
            "Downloaded snapshot from S3"
        );

        Ok(Some(value))
    }

    async fn upload_json(&self, key: &str, payload: &Value) -> Result<(), RemoteError> {
        let full_key = self.full_key(key);
        let body = serde_json::to_vec(payload)?;
        let size_bytes = body.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| RemoteError::Upload(format!("S3 upload failed: {}", e)))?;

        tracing::info!(
            key = %full_key,
            bucket = %self.bucket,
            size_bytes = size_bytes,
            "Uploaded snapshot to S3"
        );

        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "s3"
    }
}
