use async_trait::async_trait;
use tracing::debug;

use crate::crypto::{self, Envelope};
use crate::error::{ProviderError, ProviderResult};
use crate::ops::KeyOps;
use crate::provider::Provider;

#[async_trait]
impl KeyOps for Provider {
    async fn key_encrypt(&self, plaintext: &[u8]) -> ProviderResult<Vec<u8>> {
        let key_id = self.encryption_key()?;
        crypto::encrypt(self.substrate().kms.as_ref(), key_id, plaintext).await
    }

    async fn key_decrypt(&self, sealed: &[u8]) -> ProviderResult<Vec<u8>> {
        self.encryption_key()?;
        crypto::decrypt(self.substrate().kms.as_ref(), sealed).await
    }
}

impl Provider {
    fn encryption_key(&self) -> ProviderResult<&str> {
        self.config()
            .encryption_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ProviderError::Unavailable("rack has no encryption key".to_string()))
    }

    /// Seal data at rest when the rack has a key; store it as-is otherwise.
    pub(crate) async fn seal(&self, data: &[u8]) -> ProviderResult<Vec<u8>> {
        match self.encryption_key() {
            Ok(_) => self.key_encrypt(data).await,
            Err(_) => Ok(data.to_vec()),
        }
    }

    /// Inverse of [`seal`](Self::seal). Data written before the rack had a
    /// key is not an envelope and comes back unchanged.
    pub(crate) async fn unseal(&self, data: &[u8]) -> ProviderResult<Vec<u8>> {
        if serde_json::from_slice::<Envelope>(data).is_err() {
            debug!(bytes = data.len(), "plaintext at rest");
            return Ok(data.to_vec());
        }
        self.key_decrypt(data).await
    }
}
