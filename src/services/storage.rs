use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::collections::HashMap;
use std::sync::Mutex;

/// Durable object storage for re-hosted results.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `data` under `key` and return its stable public locator.
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<String, StorageError>;
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    bucket: Box<Bucket>,
    public_url: String,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        public_url: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self {
            bucket,
            public_url: public_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn public_locator(&self, key: &str) -> String {
        format!("{}/{key}", self.public_url)
    }
}

#[async_trait]
impl ObjectStorage for R2Client {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<String, StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;

        let code = response.status_code();
        if !(200..300).contains(&code) {
            return Err(StorageError::Rejected { key: key.to_string(), code });
        }
        Ok(self.public_locator(key))
    }
}

/// Keeps objects in memory. Used by tests and local runs without R2.
#[derive(Debug)]
pub struct MemoryStorage {
    base_url: String,
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    puts: Mutex<usize>,
}

impl MemoryStorage {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            objects: Mutex::new(HashMap::new()),
            puts: Mutex::new(0),
        }
    }

    /// Number of `put` calls, including overwrites.
    pub fn put_count(&self) -> usize {
        *self.puts.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<(Vec<u8>, String)> {
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<String, StorageError> {
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), (data.to_vec(), content_type.to_string()));
        *self.puts.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        Ok(format!("{}/{key}", self.base_url))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Storage rejected object {key} with status {code}")]
    Rejected { key: String, code: u16 },

    #[error("Storage configuration error: {0}")]
    Config(String),
}
