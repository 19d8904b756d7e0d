//! Content-addressed source index.
//!
//! File bodies live in the rack settings bucket at `index/{sha256}`. A client
//! asks which hashes are missing, uploads only those, and a build downloads
//! the whole index into a scratch directory.

use std::path::{Component, Path};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use rack_core::{Index, IndexEntry, content_hash};
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};
use crate::ops::IndexOps;
use crate::provider::Provider;

/// Transfers in flight at once for one index.
pub const INDEX_CONCURRENCY: usize = 128;

const INDEX_EXISTS: &str = "index.exists";
/// Stored bodies never change under their hash.
const INDEX_EXISTS_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

fn index_key(hash: &str) -> String {
    format!("index/{hash}")
}

/// Entry names must stay below the download directory.
fn safe_name(name: &str) -> ProviderResult<&Path> {
    let path = Path::new(name);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if name.is_empty() || escapes {
        return Err(ProviderError::validation(format!("invalid index entry: {name}")));
    }
    Ok(path)
}

#[async_trait]
impl IndexOps for Provider {
    async fn index_diff(&self, index: &Index) -> ProviderResult<Vec<String>> {
        let missing: Vec<Option<String>> = stream::iter(index.keys().cloned())
            .map(|hash| async move {
                let stored = self.index_exists(&hash).await?;
                Ok::<_, ProviderError>((!stored).then_some(hash))
            })
            .buffered(INDEX_CONCURRENCY)
            .try_collect()
            .await?;
        let missing: Vec<String> = missing.into_iter().flatten().collect();
        debug!(entries = index.len(), missing = missing.len(), "index diffed");
        Ok(missing)
    }

    async fn index_download(&self, index: &Index, dir: &Path) -> ProviderResult<()> {
        for entry in index.values() {
            safe_name(&entry.name)?;
        }

        stream::iter(index.iter().map(|(hash, entry)| (hash.clone(), entry.clone())))
            .map(Ok::<_, ProviderError>)
            .try_for_each_concurrent(INDEX_CONCURRENCY, |(hash, entry)| async move {
                self.download_entry(&hash, &entry, dir).await
            })
            .await?;
        debug!(entries = index.len(), dir = %dir.display(), "index downloaded");
        Ok(())
    }

    async fn index_upload(&self, hash: &str, data: Vec<u8>) -> ProviderResult<()> {
        if content_hash(&data) != hash {
            return Err(ProviderError::validation(format!("content does not match hash: {hash}")));
        }
        let bucket = &self.config().settings_bucket;
        self.call(self.substrate().objects.put(bucket, &index_key(hash), data, false))
            .await?;
        self.cache().set(INDEX_EXISTS, hash, true, INDEX_EXISTS_TTL);
        Ok(())
    }
}

impl Provider {
    /// Only hits are cached; a miss may be filled by the next upload.
    async fn index_exists(&self, hash: &str) -> ProviderResult<bool> {
        if self.reads_cache() && self.cache().get::<bool, _>(INDEX_EXISTS, hash).unwrap_or(false) {
            return Ok(true);
        }
        let bucket = &self.config().settings_bucket;
        let exists = self
            .call(self.substrate().objects.exists(bucket, &index_key(hash)))
            .await?;
        if exists && self.reads_cache() {
            self.cache().set(INDEX_EXISTS, hash, true, INDEX_EXISTS_TTL);
        }
        Ok(exists)
    }

    async fn download_entry(&self, hash: &str, entry: &IndexEntry, dir: &Path) -> ProviderResult<()> {
        let bucket = &self.config().settings_bucket;
        let data = match self.call(self.substrate().objects.get(bucket, &index_key(hash))).await {
            Ok(data) => data,
            Err(e) if e.is_code("NoSuchKey") => {
                return Err(ProviderError::not_found(format!("index entry missing: {hash}")));
            }
            Err(e) => return Err(e.into()),
        };
        if content_hash(&data) != hash {
            return Err(ProviderError::internal(format!("index entry corrupt: {hash}")));
        }

        let target = dir.join(safe_name(&entry.name)?);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, data).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = entry.mode & 0o7777;
            if mode != 0 {
                tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode)).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestRack;
    use chrono::Utc;

    fn entry(name: &str) -> IndexEntry {
        IndexEntry {
            name: name.to_string(),
            mode: 0o644,
            mod_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn diff_reports_only_missing_bodies() {
        let rack = TestRack::new();
        let p = &rack.provider;
        let stored = b"stored".to_vec();
        let stored_hash = content_hash(&stored);
        p.index_upload(&stored_hash, stored).await.unwrap();

        let missing_hash = content_hash(b"missing");
        let index = Index::from([
            (stored_hash, entry("a.txt")),
            (missing_hash.clone(), entry("b.txt")),
        ]);
        assert_eq!(p.index_diff(&index).await.unwrap(), [missing_hash]);
    }

    #[tokio::test]
    async fn uncached_diff_rechecks_the_bucket() {
        let rack = TestRack::new();
        let p = &rack.provider;
        let body = b"body".to_vec();
        let hash = content_hash(&body);
        p.index_upload(&hash, body).await.unwrap();

        let bucket = &p.config().settings_bucket;
        p.substrate().objects.delete(bucket, &index_key(&hash)).await.unwrap();

        let index = Index::from([(hash.clone(), entry("a.txt"))]);
        assert!(p.index_diff(&index).await.unwrap().is_empty());
        assert_eq!(p.without_cache().index_diff(&index).await.unwrap(), [hash]);
    }

    #[tokio::test]
    async fn upload_rejects_mismatched_content() {
        let rack = TestRack::new();
        let err = rack
            .provider
            .index_upload(&content_hash(b"one"), b"two".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
    }

    #[tokio::test]
    async fn download_writes_the_tree() {
        let rack = TestRack::new();
        let p = &rack.provider;
        let mut index = Index::new();
        for (name, body) in [("Dockerfile", "FROM scratch\n"), ("src/main.rs", "fn main() {}\n")] {
            let hash = content_hash(body.as_bytes());
            p.index_upload(&hash, body.as_bytes().to_vec()).await.unwrap();
            index.insert(hash, entry(name));
        }

        let dir = tempfile::tempdir().unwrap();
        p.index_download(&index, dir.path()).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/main.rs")).unwrap(),
            "fn main() {}\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("Dockerfile")).unwrap(),
            "FROM scratch\n"
        );
    }

    #[tokio::test]
    async fn download_refuses_escaping_names() {
        let rack = TestRack::new();
        let index = Index::from([(content_hash(b"x"), entry("../../etc/passwd"))]);
        let dir = tempfile::tempdir().unwrap();
        let err = rack.provider.index_download(&index, dir.path()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
    }

    #[tokio::test]
    async fn missing_body_fails_the_download() {
        let rack = TestRack::new();
        let index = Index::from([(content_hash(b"never uploaded"), entry("a"))]);
        let dir = tempfile::tempdir().unwrap();
        assert!(rack
            .provider
            .index_download(&index, dir.path())
            .await
            .unwrap_err()
            .is_not_found());
    }
}
