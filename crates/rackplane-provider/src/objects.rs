use async_trait::async_trait;
use rack_core::{Object, ObjectStoreOptions};
use rackplane_substrate::objects::object_url;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};
use crate::ops::ObjectOps;
use crate::provider::Provider;

/// Random key for objects stored without one.
fn temp_key() -> String {
    format!("tmp/{}", hex::encode(rand::random::<[u8; 16]>()))
}

#[async_trait]
impl ObjectOps for Provider {
    async fn object_fetch(&self, app: &str, key: &str) -> ProviderResult<Vec<u8>> {
        let bucket = self.app_resource(app, "Settings").await?;
        match self.call(self.substrate().objects.get(&bucket, key)).await {
            Ok(data) => Ok(data),
            Err(e) if e.is_code("NoSuchKey") => Err(ProviderError::not_found(format!("no such key: {key}"))),
            Err(e) => Err(e.into()),
        }
    }

    async fn object_store(&self, app: &str, key: &str, data: Vec<u8>, opts: ObjectStoreOptions) -> ProviderResult<Object> {
        let key = match key {
            "" => temp_key(),
            key => key.to_string(),
        };
        let bucket = self.app_resource(app, "Settings").await?;
        let bytes = data.len();
        self.call(self.substrate().objects.put(&bucket, &key, data, opts.public))
            .await?;
        debug!(%app, %key, bytes, public = opts.public, "object stored");

        let url = if opts.public {
            object_url(&self.config().region, &bucket, &key)
        } else {
            format!("object://{app}/{key}")
        };
        Ok(Object { url })
    }

    async fn object_delete(&self, app: &str, key: &str) -> ProviderResult<()> {
        if !self.object_exists(app, key).await? {
            return Err(ProviderError::not_found(format!("no such object: {key}")));
        }
        let bucket = self.app_resource(app, "Settings").await?;
        self.call(self.substrate().objects.delete(&bucket, key)).await?;
        Ok(())
    }

    async fn object_exists(&self, app: &str, key: &str) -> ProviderResult<bool> {
        let bucket = self.app_resource(app, "Settings").await?;
        Ok(self.call(self.substrate().objects.exists(&bucket, key)).await?)
    }

    /// Keys directly below `prefix`; deeper keys are not descended into.
    async fn object_list(&self, app: &str, prefix: &str) -> ProviderResult<Vec<String>> {
        let bucket = self.app_resource(app, "Settings").await?;
        let keys = self.call(self.substrate().objects.list(&bucket, prefix)).await?;
        Ok(keys
            .into_iter()
            .filter(|k| k.strip_prefix(prefix).is_some_and(|rest| !rest.contains('/')))
            .collect())
    }
}
