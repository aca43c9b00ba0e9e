//! Abstract remote snapshot storage.
//!
//! The sync core depends on exactly two operations against the remote
//! object store: download a JSON document by key and upload one. There are
//! no partial updates and no conditional writes, so the last upload wins at
//! the storage layer.
//!
//! Implementations:
//! - `S3RemoteStore` (feature `s3`) for AWS S3, Cloudflare R2, MinIO
//! - `MemoryRemoteStore` for local-only operation and tests

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::Value;

/// Errors that can occur talking to the remote store.
#[derive(Debug)]
pub enum RemoteError {
    /// Configuration is missing or invalid
    Config(String),
    /// Failed to download the object
    Download(String),
    /// Failed to upload the object
    Upload(String),
    /// Stored object is not valid JSON
    Decode(String),
    /// Network or connectivity error
    Network(String),
    /// Authentication or authorization error
    Auth(String),
}

impl std::error::Error for RemoteError {}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Config(msg) => write!(f, "Configuration error: {}", msg),
            RemoteError::Download(msg) => write!(f, "Download failed: {}", msg),
            RemoteError::Upload(msg) => write!(f, "Upload failed: {}", msg),
            RemoteError::Decode(msg) => write!(f, "Invalid remote document: {}", msg),
            RemoteError::Network(msg) => write!(f, "Network error: {}", msg),
            RemoteError::Auth(msg) => write!(f, "Authentication error: {}", msg),
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::Decode(err.to_string())
    }
}

/// Trait for remote snapshot storage implementations.
///
/// # Example
///
/// ```ignore
/// use memocore::remote::{RemoteError, RemoteStore};
///
/// async fn fetch(store: &impl RemoteStore) -> Result<Option<serde_json::Value>, RemoteError> {
///     store.download_json("meow-app/app-data.json").await
/// }
/// ```
pub trait RemoteStore: Send + Sync {
    /// Download and parse the JSON document stored at `key`.
    ///
    /// # Returns
    /// * `Ok(Some(value))` - The stored document
    /// * `Ok(None)` - Nothing is stored under `key` yet
    /// * `Err(RemoteError)` - Network, auth or decode failure
    fn download_json(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Value>, RemoteError>> + Send;

    /// Serialize `payload` and store it at `key`, replacing any previous
    /// document.
    fn upload_json(
        &self,
        key: &str,
        payload: &Value,
    ) -> impl std::future::Future<Output = Result<(), RemoteError>> + Send;

    /// Get the provider name for this store (e.g. "s3", "memory").
    fn provider_name(&self) -> &'static str;
}

/// Apply an optional path prefix to an object key.
///
/// Creates a consistent key format: `{prefix}/{key}`
pub fn prefixed_key(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(p) => {
            let p = p.trim_end_matches('/');
            if p.is_empty() {
                key.to_string()
            } else {
                format!("{}/{}", p, key.trim_start_matches('/'))
            }
        }
        None => key.to_string(),
    }
}

/// In-memory remote store.
///
/// Keeps documents in a map and counts calls. Failures can be injected for
/// either direction, which makes it the remote of choice for exercising the
/// sync cycle without network access.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    objects: Mutex<HashMap<String, Value>>,
    downloads: AtomicUsize,
    uploads: AtomicUsize,
    download_error: Mutex<Option<String>>,
    upload_error: Mutex<Option<String>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store already holding `value` at `key`
    pub fn with_object(key: &str, value: Value) -> Self {
        let store = Self::new();
        store.put(key, value);
        store
    }

    /// Store a document directly, bypassing the call counters
    pub fn put(&self, key: &str, value: Value) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(key.to_string(), value);
        }
    }

    /// Read a document directly, bypassing the call counters
    pub fn get(&self, key: &str) -> Option<Value> {
        self.objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(key).cloned())
    }

    /// Make every download fail with a network error
    pub fn fail_downloads(&self, message: Option<&str>) {
        if let Ok(mut slot) = self.download_error.lock() {
            *slot = message.map(String::from);
        }
    }

    /// Make every upload fail with a network error
    pub fn fail_uploads(&self, message: Option<&str>) {
        if let Ok(mut slot) = self.upload_error.lock() {
            *slot = message.map(String::from);
        }
    }

    /// Number of `download_json` calls so far
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Number of `upload_json` calls so far
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    fn injected(slot: &Mutex<Option<String>>) -> Option<String> {
        slot.lock().ok().and_then(|guard| guard.clone())
    }
}

impl RemoteStore for MemoryRemoteStore {
    async fn download_json(&self, key: &str) -> Result<Option<Value>, RemoteError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = Self::injected(&self.download_error) {
            return Err(RemoteError::Network(msg));
        }
        let objects = self
            .objects
            .lock()
            .map_err(|_| RemoteError::Download("store lock poisoned".to_string()))?;
        Ok(objects.get(key).cloned())
    }

    async fn upload_json(&self, key: &str, payload: &Value) -> Result<(), RemoteError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = Self::injected(&self.upload_error) {
            return Err(RemoteError::Network(msg));
        }
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| RemoteError::Upload("store lock poisoned".to_string()))?;
        objects.insert(key.to_string(), payload.clone());
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}
