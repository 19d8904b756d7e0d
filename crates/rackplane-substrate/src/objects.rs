//! Bucketed blob storage.

use async_trait::async_trait;

use crate::error::SubstrateResult;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Missing keys fail with `NoSuchKey`.
    async fn get(&self, bucket: &str, key: &str) -> SubstrateResult<Vec<u8>>;

    async fn put(&self, bucket: &str, key: &str, data: Vec<u8>, public: bool) -> SubstrateResult<()>;

    async fn delete(&self, bucket: &str, key: &str) -> SubstrateResult<()>;

    async fn exists(&self, bucket: &str, key: &str) -> SubstrateResult<bool>;

    /// Keys under `prefix`, sorted.
    async fn list(&self, bucket: &str, prefix: &str) -> SubstrateResult<Vec<String>>;

    /// Remove every object and the bucket itself.
    async fn delete_bucket(&self, bucket: &str) -> SubstrateResult<()>;
}

/// Addressable URL for an object, as handed to the stack engine.
pub fn object_url(region: &str, bucket: &str, key: &str) -> String {
    format!("https://s3.{region}.amazonaws.com/{bucket}/{}", key.trim_start_matches('/'))
}

/// Inverse of [`object_url`].
pub fn parse_object_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("https://s3.")?;
    let (_, path) = rest.split_once(".amazonaws.com/")?;
    let (bucket, key) = path.split_once('/')?;
    Some((bucket.to_string(), key.to_string()))
}
