//! Container image registry.

use async_trait::async_trait;

use crate::error::SubstrateResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub endpoint: String,
}

/// Maximum number of tags accepted by one [`ImageRegistry::batch_delete_image`] call.
pub const BATCH_DELETE_IMAGE_LIMIT: usize = 100;

#[async_trait]
pub trait ImageRegistry: Send + Sync {
    async fn authorization_token(&self, registry_id: &str) -> SubstrateResult<RegistryAuth>;

    async fn list_image_tags(&self, registry_id: &str, repository: &str) -> SubstrateResult<Vec<String>>;

    async fn batch_delete_image(&self, registry_id: &str, repository: &str, tags: &[String]) -> SubstrateResult<()>;

    async fn delete_repository(&self, registry_id: &str, repository: &str) -> SubstrateResult<()>;

    /// Verify credentials against an external registry. Rejection fails
    /// with an `Unauthorized` code.
    async fn login(&self, server: &str, username: &str, password: &str) -> SubstrateResult<()>;
}
