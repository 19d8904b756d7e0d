use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{SubstrateError, SubstrateResult};
use crate::registry::*;

type RepoKey = (String, String);

#[derive(Default)]
struct State {
    repos: BTreeMap<RepoKey, BTreeSet<String>>,
    batch_deletes: Vec<(String, String, Vec<String>)>,
    deleted_repos: Vec<RepoKey>,
    rejected: BTreeSet<String>,
}

pub struct MemoryRegistry {
    region: String,
    state: Mutex<State>,
}

impl MemoryRegistry {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn push_tag(&self, registry_id: &str, repository: &str, tag: &str) {
        self.state
            .lock()
            .repos
            .entry((registry_id.to_string(), repository.to_string()))
            .or_default()
            .insert(tag.to_string());
    }

    /// Logins against `server` fail from now on.
    pub fn reject_login(&self, server: &str) {
        self.state.lock().rejected.insert(server.to_string());
    }

    /// Every `batch_delete_image` call as `(registry, repository, tags)`.
    pub fn batch_deletes(&self) -> Vec<(String, String, Vec<String>)> {
        self.state.lock().batch_deletes.clone()
    }

    pub fn deleted_repositories(&self) -> Vec<(String, String)> {
        self.state.lock().deleted_repos.clone()
    }
}

#[async_trait]
impl ImageRegistry for MemoryRegistry {
    async fn authorization_token(&self, registry_id: &str) -> SubstrateResult<RegistryAuth> {
        Ok(RegistryAuth {
            username: "AWS".to_string(),
            password: format!("token-{registry_id}"),
            endpoint: format!("https://{registry_id}.dkr.ecr.{}.amazonaws.com", self.region),
        })
    }

    async fn list_image_tags(&self, registry_id: &str, repository: &str) -> SubstrateResult<Vec<String>> {
        self.state
            .lock()
            .repos
            .get(&(registry_id.to_string(), repository.to_string()))
            .map(|tags| tags.iter().cloned().collect())
            .ok_or_else(|| {
                SubstrateError::api(
                    "RepositoryNotFoundException",
                    format!("The repository with name '{repository}' does not exist"),
                )
            })
    }

    async fn batch_delete_image(&self, registry_id: &str, repository: &str, tags: &[String]) -> SubstrateResult<()> {
        if tags.len() > BATCH_DELETE_IMAGE_LIMIT {
            return Err(SubstrateError::api("InvalidParameterException", "too many image ids"));
        }
        let mut state = self.state.lock();
        if let Some(existing) = state
            .repos
            .get_mut(&(registry_id.to_string(), repository.to_string()))
        {
            for tag in tags {
                existing.remove(tag);
            }
        }
        state
            .batch_deletes
            .push((registry_id.to_string(), repository.to_string(), tags.to_vec()));
        Ok(())
    }

    async fn delete_repository(&self, registry_id: &str, repository: &str) -> SubstrateResult<()> {
        let key = (registry_id.to_string(), repository.to_string());
        let mut state = self.state.lock();
        state.repos.remove(&key);
        state.deleted_repos.push(key);
        Ok(())
    }

    async fn login(&self, server: &str, _username: &str, _password: &str) -> SubstrateResult<()> {
        if self.state.lock().rejected.contains(server) {
            return Err(SubstrateError::api("Unauthorized", format!("login to {server} rejected")));
        }
        Ok(())
    }
}
