use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info};

use crate::app::ports::{PutOutcome, StoragePort};
use crate::config::{MirrorConfig, RetryConfig};
use crate::domain::Namespace;
use crate::error::StorageError;
use crate::infra::retry::with_retry;

/// S3-compatible object store reached over plain HTTP path-style URLs:
/// `<endpoint>/<bucket>/<name>`, one bucket per namespace.
pub struct HttpObjectStore {
    client: Client,
    config: MirrorConfig,
}

impl HttpObjectStore {
    pub fn new(config: MirrorConfig) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn bucket(&self, namespace: Namespace) -> &str {
        match namespace {
            Namespace::Raw => &self.config.raw_bucket,
            Namespace::Validated => &self.config.validated_bucket,
            Namespace::Classified => &self.config.classified_bucket,
        }
    }

    fn bucket_url(&self, bucket: &str) -> String {
        format!("{}/{}", self.config.endpoint.trim_end_matches('/'), bucket)
    }

    fn object_url(&self, namespace: Namespace, name: &str) -> String {
        format!("{}/{}", self.bucket_url(self.bucket(namespace)), name)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<bool, StorageError> {
        let resp = self.authorize(self.client.put(self.bucket_url(bucket))).send().await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::CONFLICT => Ok(false),
            s => Err(StorageError::Backend {
                message: format!("creating bucket '{}' returned {}", bucket, s),
            }),
        }
    }

    /// Create one bucket per namespace, retrying each with fixed backoff.
    /// Returns the buckets that were newly created.
    pub async fn ensure_buckets(&self, retry: &RetryConfig) -> Result<Vec<String>, StorageError> {
        let mut created = Vec::new();
        for namespace in Namespace::ALL {
            let bucket = self.bucket(namespace).to_string();
            let what = format!("create bucket '{}'", bucket);
            if with_retry(retry, &what, |_| self.create_bucket(&bucket)).await? {
                info!("🪣 Created bucket '{}'", bucket);
                created.push(bucket);
            } else {
                info!("🪣 Bucket '{}' already exists", bucket);
            }
        }
        Ok(created)
    }
}

#[async_trait]
impl StoragePort for HttpObjectStore {
    async fn put(&self, namespace: Namespace, name: &str, bytes: Vec<u8>) -> Result<PutOutcome, StorageError> {
        let url = self.object_url(namespace, name);
        let len = bytes.len();
        let resp = self
            .authorize(self.client.put(&url))
            .header("Content-Type", "application/json")
            .body(bytes)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(StorageError::Backend {
                message: format!("PUT {} returned {}", url, resp.status()),
            });
        }
        debug!(%url, bytes = len, "uploaded object");
        Ok(PutOutcome::Stored)
    }

    async fn get(&self, namespace: Namespace, name: &str) -> Result<Vec<u8>, StorageError> {
        let url = self.object_url(namespace, name);
        let resp = self.authorize(self.client.get(&url)).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(StorageError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            s if s.is_success() => Ok(resp.bytes().await?.to_vec()),
            s => Err(StorageError::Backend {
                message: format!("GET {} returned {}", url, s),
            }),
        }
    }

    fn describe(&self) -> String {
        format!("s3:{}", self.config.endpoint)
    }
}
