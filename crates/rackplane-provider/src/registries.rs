//! Credentials for external image registries.
//!
//! Each registry is one sealed setting at `system/registries/{sha256(server)}`
//! holding the JSON-encoded credentials.

use async_trait::async_trait;
use rack_core::Registry;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{ProviderError, ProviderResult};
use crate::ops::{RegistryOps, SettingsOps};
use crate::provider::Provider;

const REGISTRY_PREFIX: &str = "system/registries/";

fn registry_key(server: &str) -> String {
    format!("{REGISTRY_PREFIX}{}", hex::encode(Sha256::digest(server.as_bytes())))
}

#[async_trait]
impl RegistryOps for Provider {
    async fn registry_add(&self, server: &str, username: &str, password: &str) -> ProviderResult<Registry> {
        match self
            .call(self.substrate().registry.login(server, username, password))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_code("Unauthorized") => {
                warn!(%server, %username, "registry login rejected");
                return Err(ProviderError::Unauthorized("unable to authenticate".to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let registry = Registry {
            server: server.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        };
        self.setting_put(&registry_key(server), &serde_json::to_vec(&registry)?)
            .await?;
        info!(%server, %username, "registry added");
        Ok(registry)
    }

    async fn registry_remove(&self, server: &str) -> ProviderResult<()> {
        let key = registry_key(server);
        if !self.setting_exists(&key).await? {
            return Err(ProviderError::not_found(format!("no such registry: {server}")));
        }
        self.setting_delete(&key).await?;
        info!(%server, "registry removed");
        Ok(())
    }

    async fn registry_list(&self) -> ProviderResult<Vec<Registry>> {
        let mut registries = Vec::new();
        for key in self.setting_list(REGISTRY_PREFIX).await? {
            let data = self.setting_get(&key).await?;
            registries.push(serde_json::from_slice::<Registry>(&data)?);
        }
        registries.sort_by(|a, b| a.server.cmp(&b.server));
        Ok(registries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::TestRack;

    #[test]
    fn keys_hash_the_server() {
        let key = registry_key("quay.io");
        assert!(key.starts_with("system/registries/"));
        assert_eq!(key.len(), REGISTRY_PREFIX.len() + 64);
        assert_eq!(key, registry_key("quay.io"));
    }

    #[tokio::test]
    async fn add_list_remove() {
        let rack = TestRack::new();
        let p = &rack.provider;
        p.registry_add("quay.io", "bob", "pw1").await.unwrap();
        p.registry_add("docker.io", "alice", "pw2").await.unwrap();

        let servers: Vec<_> = p.registry_list().await.unwrap().into_iter().map(|r| r.server).collect();
        assert_eq!(servers, ["docker.io", "quay.io"]);

        p.registry_remove("quay.io").await.unwrap();
        assert_eq!(p.registry_list().await.unwrap().len(), 1);
        assert!(p.registry_remove("quay.io").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn rejected_login_is_unauthorized_and_not_stored() {
        let rack = TestRack::new();
        rack.cloud.registry.reject_login("private.example.org");

        let err = rack
            .provider
            .registry_add("private.example.org", "bob", "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unauthorized(_)));
        assert!(rack.provider.registry_list().await.unwrap().is_empty());
    }
}
