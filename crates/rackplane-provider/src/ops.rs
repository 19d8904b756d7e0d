//! Provider operations, one trait per entity.
//!
//! [`Provider`](crate::Provider) implements every trait. Callers that only
//! need one entity can depend on that trait alone and substitute a test
//! double for it.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use rack_core::{
    App, AppCreateOptions, Build, BuildCreateOptions, BuildSource, BuildUpdateOptions, Capacity, Certificate,
    Environment, Event, ExecOptions, Index, Instance, LogsOptions, Metric, MetricsOptions, Object, ObjectStoreOptions,
    Process, ProcessRunOptions, ProcessStats, Registry, Release, ReleaseCreateOptions, Resource, ResourceType, System,
    SystemUpdateOptions,
};
use rackplane_stream::PipeReader;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{ProviderError, ProviderResult};

/// A bidirectional client byte stream.
pub trait ClientStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> ClientStream for T {}

#[async_trait]
pub trait AppOps {
    /// Abort an in-flight stack update.
    async fn app_cancel(&self, name: &str) -> ProviderResult<()>;
    async fn app_create(&self, name: &str, opts: AppCreateOptions) -> ProviderResult<App>;
    async fn app_get(&self, name: &str) -> ProviderResult<App>;
    async fn app_list(&self) -> ProviderResult<Vec<App>>;
    /// Fails with `InUse` while a resource links the app.
    async fn app_delete(&self, name: &str) -> ProviderResult<()>;
    /// Tail the app's log group into a pipe.
    async fn app_logs(&self, name: &str, opts: LogsOptions) -> ProviderResult<PipeReader>;
}

#[async_trait]
pub trait BuildOps {
    async fn build_create(&self, app: &str, source: BuildSource, opts: BuildCreateOptions) -> ProviderResult<Build>;
    async fn build_get(&self, app: &str, id: &str) -> ProviderResult<Build>;
    async fn build_list(&self, app: &str, limit: usize) -> ProviderResult<Vec<Build>>;
    /// Fails with `InUse` when the build backs the active release.
    async fn build_delete(&self, app: &str, id: &str) -> ProviderResult<Build>;
    async fn build_logs(&self, app: &str, id: &str) -> ProviderResult<String>;
    async fn build_save(&self, build: &Build) -> ProviderResult<()>;
    /// Callback path for the build container. Terminal builds only accept a release.
    async fn build_update(&self, app: &str, id: &str, opts: BuildUpdateOptions) -> ProviderResult<Build>;
    /// Materialize a release from a build and the latest env.
    async fn build_release(&self, build: &Build) -> ProviderResult<Release>;
    /// Re-tag a build's images into another app.
    async fn build_copy(&self, src_app: &str, id: &str, dest_app: &str) -> ProviderResult<Build>;
}

#[async_trait]
pub trait ReleaseOps {
    async fn release_create(&self, app: &str, opts: ReleaseCreateOptions) -> ProviderResult<Release>;
    async fn release_get(&self, app: &str, id: &str) -> ProviderResult<Release>;
    async fn release_list(&self, app: &str, limit: usize) -> ProviderResult<Vec<Release>>;
    async fn release_save(&self, release: &Release) -> ProviderResult<()>;
    async fn release_promote(&self, app: &str, id: &str) -> ProviderResult<()>;
    /// Delete every release made from `build`.
    async fn release_delete(&self, app: &str, build: &str) -> ProviderResult<()>;
}

#[async_trait]
pub trait EnvironmentOps {
    async fn environment_get(&self, app: &str) -> ProviderResult<Environment>;
    /// Returns the id of the release carrying the new env.
    async fn environment_put(&self, app: &str, env: Environment) -> ProviderResult<String>;
}

#[async_trait]
pub trait ProcessOps {
    async fn process_list(&self, app: &str) -> ProviderResult<Vec<Process>>;
    async fn process_get(&self, app: &str, pid: &str) -> ProviderResult<Process>;
    async fn process_stop(&self, app: &str, pid: &str) -> ProviderResult<()>;
    /// Run `command` inside a process, relaying `stream`. Returns the exit code.
    async fn process_exec<S: ClientStream>(
        &self,
        app: &str,
        pid: &str,
        command: &str,
        stream: S,
        opts: ExecOptions,
    ) -> ProviderResult<i32>;
    /// Start a one-off process in the background. Returns its pid.
    async fn process_run(&self, app: &str, opts: ProcessRunOptions) -> ProviderResult<String>;
    /// Start a one-off process and attach `stream` to it. Returns the exit code.
    async fn process_attach<S: ClientStream>(&self, app: &str, opts: ProcessRunOptions, stream: S) -> ProviderResult<i32>;
    async fn process_stats(&self, app: &str, pid: &str) -> ProviderResult<ProcessStats>;
    /// Splice `stream` to `host:port`.
    async fn proxy<S: ClientStream>(&self, host: &str, port: u16, stream: S) -> ProviderResult<()>;
}

#[async_trait]
pub trait ResourceOps {
    async fn resource_create(&self, name: &str, kind: &str, params: BTreeMap<String, String>) -> ProviderResult<Resource>;
    async fn resource_get(&self, name: &str) -> ProviderResult<Resource>;
    async fn resource_list(&self) -> ProviderResult<Vec<Resource>>;
    async fn resource_update(&self, name: &str, params: BTreeMap<String, String>) -> ProviderResult<Resource>;
    /// Fails with `InUse` while any app is linked.
    async fn resource_delete(&self, name: &str) -> ProviderResult<Resource>;
    async fn resource_link(&self, name: &str, app: &str) -> ProviderResult<Resource>;
    async fn resource_unlink(&self, name: &str, app: &str) -> ProviderResult<Resource>;
    fn resource_types(&self) -> Vec<ResourceType>;
}

#[async_trait]
pub trait CertificateOps {
    async fn certificate_create(&self, public: &str, key: &str, chain: Option<&str>) -> ProviderResult<Certificate>;
    async fn certificate_generate(&self, domains: &[String]) -> ProviderResult<Certificate>;
    async fn certificate_list(&self) -> ProviderResult<Vec<Certificate>>;
    async fn certificate_delete(&self, id: &str) -> ProviderResult<()>;
    async fn certificate_apply(&self, app: &str, service: &str, port: u16, id: &str) -> ProviderResult<()>;
}

#[async_trait]
pub trait ObjectOps {
    async fn object_fetch(&self, app: &str, key: &str) -> ProviderResult<Vec<u8>>;
    /// An empty key stores under a generated `tmp/` key.
    async fn object_store(&self, app: &str, key: &str, data: Vec<u8>, opts: ObjectStoreOptions) -> ProviderResult<Object>;
    async fn object_delete(&self, app: &str, key: &str) -> ProviderResult<()>;
    async fn object_exists(&self, app: &str, key: &str) -> ProviderResult<bool>;
    async fn object_list(&self, app: &str, prefix: &str) -> ProviderResult<Vec<String>>;
}

#[async_trait]
pub trait RegistryOps {
    async fn registry_add(&self, server: &str, username: &str, password: &str) -> ProviderResult<Registry>;
    async fn registry_remove(&self, server: &str) -> ProviderResult<()>;
    async fn registry_list(&self) -> ProviderResult<Vec<Registry>>;
}

#[async_trait]
pub trait SettingsOps {
    async fn setting_get(&self, name: &str) -> ProviderResult<Vec<u8>>;
    async fn setting_put(&self, name: &str, value: &[u8]) -> ProviderResult<()>;
    async fn setting_delete(&self, name: &str) -> ProviderResult<()>;
    async fn setting_exists(&self, name: &str) -> ProviderResult<bool>;
    async fn setting_list(&self, prefix: &str) -> ProviderResult<Vec<String>>;
}

#[async_trait]
pub trait IndexOps {
    /// Hashes of `index` whose bodies are not stored yet.
    async fn index_diff(&self, index: &Index) -> ProviderResult<Vec<String>>;
    /// Write every indexed file below `dir`.
    async fn index_download(&self, index: &Index, dir: &Path) -> ProviderResult<()>;
    async fn index_upload(&self, hash: &str, data: Vec<u8>) -> ProviderResult<()>;
}

#[async_trait]
pub trait InstanceOps {
    async fn instance_list(&self) -> ProviderResult<Vec<Instance>>;
    async fn instance_terminate(&self, id: &str) -> ProviderResult<()>;
    async fn instance_keyroll(&self) -> ProviderResult<()>;
}

#[async_trait]
pub trait KeyOps {
    async fn key_encrypt(&self, plaintext: &[u8]) -> ProviderResult<Vec<u8>>;
    async fn key_decrypt(&self, sealed: &[u8]) -> ProviderResult<Vec<u8>>;
}

#[async_trait]
pub trait EventOps {
    /// Publish an event. A supplied error marks it failed.
    async fn event_send(&self, event: Event, error: Option<&ProviderError>) -> ProviderResult<()>;
}

#[async_trait]
pub trait SystemOps {
    async fn system_get(&self) -> ProviderResult<System>;
    async fn system_update(&self, opts: SystemUpdateOptions) -> ProviderResult<()>;
    async fn system_releases(&self) -> ProviderResult<Vec<Release>>;
    async fn system_processes(&self, all: bool) -> ProviderResult<Vec<Process>>;
    async fn system_logs(&self, opts: LogsOptions) -> ProviderResult<PipeReader>;
    async fn system_metrics(&self, opts: MetricsOptions) -> ProviderResult<Vec<Metric>>;
    async fn capacity_get(&self) -> ProviderResult<Capacity>;
}
