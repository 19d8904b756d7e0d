//! Build and image expiry.
//!
//! Keeps the newest builds of every app plus whatever the active release
//! points at; older build rows and their registry tags are deleted in
//! batches.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use rack_core::App;
use rackplane_provider::{AppOps, BuildOps, Provider, ReleaseOps};
use rackplane_substrate::registry::BATCH_DELETE_IMAGE_LIMIT;
use rackplane_substrate::tables::BATCH_DELETE_LIMIT;
use tracing::{debug, info, warn};

use crate::runner::Worker;

pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Builds kept per app, not counting the active one.
pub const MAX_BUILDS: usize = 50;

/// How far back one pass looks for expired builds.
const BUILD_SCAN_LIMIT: usize = 1000;

pub struct Cleanup {
    provider: Provider,
    keep: usize,
}

impl Cleanup {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            keep: MAX_BUILDS,
        }
    }

    pub fn keep(mut self, keep: usize) -> Self {
        self.keep = keep;
        self
    }

    async fn active_build(&self, app: &App) -> anyhow::Result<Option<String>> {
        if app.release.is_empty() {
            return Ok(None);
        }
        let release = self.provider.release_get(&app.name, &app.release).await?;
        Ok(Some(release.build).filter(|b| !b.is_empty()))
    }

    /// Expire one app. Returns `(builds, images)` removed.
    pub async fn cleanup_app(&self, app: &App) -> anyhow::Result<(usize, usize)> {
        let active = self.active_build(app).await?;
        let builds = self.provider.build_list(&app.name, BUILD_SCAN_LIMIT).await?;

        let mut kept: BTreeSet<String> = builds.iter().take(self.keep).map(|b| b.id.clone()).collect();
        kept.extend(active.clone());

        let expired: Vec<String> = builds
            .iter()
            .skip(self.keep)
            .map(|b| b.id.clone())
            .filter(|id| Some(id) != active.as_ref())
            .collect();

        let table = &self.provider.config().dynamo_builds;
        for chunk in expired.chunks(BATCH_DELETE_LIMIT) {
            self.provider
                .call(self.provider.substrate().tables.batch_delete(table, chunk))
                .await?;
        }

        let images = self.cleanup_images(app, &kept).await?;
        Ok((expired.len(), images))
    }

    async fn cleanup_images(&self, app: &App, kept: &BTreeSet<String>) -> anyhow::Result<usize> {
        let (registry_id, repository) = (app.output("RegistryId"), app.output("RegistryRepository"));
        if repository.is_empty() {
            debug!(app = %app.name, "no registry repository");
            return Ok(0);
        }

        let registry = &self.provider.substrate().registry;
        let tags = self.provider.call(registry.list_image_tags(registry_id, repository)).await?;

        let expired: Vec<String> = tags
            .into_iter()
            .filter(|tag| match tag.split_once('.') {
                Some((_, build)) => build.starts_with('B') && !kept.contains(build),
                None => false,
            })
            .collect();

        for chunk in expired.chunks(BATCH_DELETE_IMAGE_LIMIT) {
            self.provider
                .call(registry.batch_delete_image(registry_id, repository, chunk))
                .await?;
        }
        Ok(expired.len())
    }
}

#[async_trait]
impl Worker for Cleanup {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn interval(&self) -> Duration {
        CLEANUP_INTERVAL
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        for app in self.provider.app_list().await? {
            match self.cleanup_app(&app).await {
                Ok((builds, images)) => info!(app = %app.name, builds, images, "expired builds"),
                Err(e) => warn!(app = %app.name, error = %e, "cleanup failed"),
            }
        }
        Ok(())
    }
}
