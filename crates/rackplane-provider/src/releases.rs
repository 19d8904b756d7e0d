//! Releases and the app environment.
//!
//! Rows live in the releases table; the env of each release is sealed into
//! the app's settings bucket at `releases/{id}/env`. Promotion renders the
//! app template for the release, stores it next to the env, and points the
//! app stack at it. A detached waiter reports the outcome as a
//! `release:promote` event.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rack_core::time::{from_sortable, to_sortable};
use rack_core::{Environment, Event, Release, ReleaseCreateOptions, ServiceIndex};
use rackplane_substrate::Item;
use rackplane_substrate::tables::{BATCH_DELETE_LIMIT, item_id};
use tracing::{debug, info, warn};

use crate::context::CallContext;
use crate::error::{ProviderError, ProviderResult};
use crate::ops::{AppOps, BuildOps, EnvironmentOps, ReleaseOps};
use crate::provider::Provider;
use crate::render::AppTemplate;
use crate::stack::is_settling;

const PROMOTION_POLL: Duration = Duration::from_secs(5);
/// Stack stabilization has been seen to take hours.
const PROMOTION_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60);

/// Release row attribute holding the run task definitions registered for it.
pub(crate) const RUN_DEFINITIONS: &str = "definitions";

fn env_key(id: &str) -> String {
    format!("releases/{id}/env")
}

fn template_key(id: &str) -> String {
    format!("templates/{id}")
}

pub(crate) fn release_to_item(release: &Release) -> Item {
    let mut item = Item::new();
    item.insert("id".into(), release.id.clone());
    item.insert("app".into(), release.app.clone());
    item.insert("created".into(), to_sortable(&release.created));
    if !release.build.is_empty() {
        item.insert("build".into(), release.build.clone());
    }
    if !release.manifest.is_empty() {
        item.insert("manifest".into(), release.manifest.clone());
    }
    item
}

pub(crate) fn release_from_item(item: &Item) -> Release {
    let attr = |key: &str| item.get(key).cloned().unwrap_or_default();
    Release {
        id: attr("id"),
        app: attr("app"),
        build: attr("build"),
        env: Environment::default(),
        manifest: attr("manifest"),
        created: item
            .get("created")
            .and_then(|s| from_sortable(s))
            .unwrap_or_default(),
    }
}

#[async_trait]
impl ReleaseOps for Provider {
    async fn release_create(&self, app: &str, opts: ReleaseCreateOptions) -> ProviderResult<Release> {
        let mut release = Release::new(app);
        if let Some(latest) = self.latest_release(app).await? {
            release.build = latest.build;
            release.env = latest.env;
        }
        if let Some(build) = opts.build {
            release.build = build;
        }
        if let Some(env) = opts.env {
            release.env = env;
        }
        if !release.build.is_empty() {
            release.manifest = self.build_get(app, &release.build).await?.manifest;
        }

        self.release_save(&release).await?;
        info!(%app, release = %release.id, build = %release.build, "release created");

        let event = Event::new("release:create").with("app", app).with("id", &release.id);
        self.notify(event, None).await;
        Ok(release)
    }

    async fn release_get(&self, app: &str, id: &str) -> ProviderResult<Release> {
        if id.is_empty() {
            return Err(ProviderError::validation("release id must not be empty"));
        }
        let item = self
            .call(self.substrate().tables.get_item(&self.config().dynamo_releases, id))
            .await?
            .ok_or_else(|| ProviderError::not_found(format!("no such release: {id}")))?;

        let mut release = release_from_item(&item);
        if release.app != app {
            return Err(ProviderError::not_found(format!("no such release: {id}")));
        }

        let bucket = self.app_resource(app, "Settings").await?;
        match self.call(self.substrate().objects.get(&bucket, &env_key(id))).await {
            Ok(sealed) => {
                let plain = self.unseal(&sealed).await?;
                release.env = Environment::parse(&String::from_utf8_lossy(&plain));
            }
            Err(e) if e.is_code("NoSuchKey") => debug!(%app, release = %id, "release has no env"),
            Err(e) => return Err(e.into()),
        }
        Ok(release)
    }

    async fn release_list(&self, app: &str, limit: usize) -> ProviderResult<Vec<Release>> {
        let app = self.app_get(app).await?;
        let rows = self
            .call(
                self.substrate()
                    .tables
                    .query_app(&self.config().dynamo_releases, &app.name, Some(limit), true),
            )
            .await?;
        Ok(rows.iter().map(release_from_item).collect())
    }

    async fn release_save(&self, release: &Release) -> ProviderResult<()> {
        if release.id.is_empty() {
            return Err(ProviderError::validation("release id can not be blank"));
        }
        let app = self.app_get(&release.app).await?;
        let bucket = self.app_resource(&app.name, "Settings").await?;

        let sealed = self.seal(release.env.to_string().as_bytes()).await?;
        self.call(
            self.substrate()
                .objects
                .put(&bucket, &env_key(&release.id), sealed, !app.is_gen2()),
        )
        .await?;

        let table = &self.config().dynamo_releases;
        let mut item = release_to_item(release);
        let existing = self.call(self.substrate().tables.get_item(table, &release.id)).await?;
        if let Some(definitions) = existing.as_ref().and_then(|row| row.get(RUN_DEFINITIONS)) {
            item.insert(RUN_DEFINITIONS.into(), definitions.clone());
        }
        self.call(self.substrate().tables.put_item(table, item)).await?;
        debug!(app = %release.app, release = %release.id, "release saved");
        Ok(())
    }

    async fn release_promote(&self, app: &str, id: &str) -> ProviderResult<()> {
        let result = self.start_promotion(app, id).await;
        if let Err(e) = &result {
            warn!(%app, release = %id, error = %e, "release promotion rejected");
            let event = Event::new("release:promote").with("app", app).with("id", id);
            self.notify(event, Some(e)).await;
        }
        result
    }

    async fn release_delete(&self, app: &str, build: &str) -> ProviderResult<()> {
        let app = self.app_get(app).await?;
        let table = &self.config().dynamo_releases;
        let rows = self
            .call(self.substrate().tables.query_app(table, &app.name, None, true))
            .await?;
        let doomed: Vec<Release> = rows
            .iter()
            .map(release_from_item)
            .filter(|r| r.build == build)
            .collect();

        if let Some(active) = doomed.iter().find(|r| r.id == app.release) {
            return Err(ProviderError::InUse(format!("cannot delete active release: {}", active.id)));
        }
        if doomed.is_empty() {
            return Ok(());
        }

        let bucket = self.app_resource(&app.name, "Settings").await?;
        for release in &doomed {
            self.call(self.substrate().objects.delete(&bucket, &env_key(&release.id)))
                .await?;
        }
        let ids: Vec<String> = rows
            .iter()
            .filter(|row| row.get("build").map(String::as_str) == Some(build))
            .filter_map(item_id)
            .map(str::to_string)
            .collect();
        for chunk in ids.chunks(BATCH_DELETE_LIMIT) {
            self.call(self.substrate().tables.batch_delete(table, chunk)).await?;
        }
        info!(app = %app.name, %build, releases = ids.len(), "releases deleted");
        Ok(())
    }
}

#[async_trait]
impl EnvironmentOps for Provider {
    async fn environment_get(&self, app: &str) -> ProviderResult<Environment> {
        Ok(self.latest_release(app).await?.map(|r| r.env).unwrap_or_default())
    }

    async fn environment_put(&self, app: &str, env: Environment) -> ProviderResult<String> {
        let release = self
            .release_create(
                app,
                ReleaseCreateOptions {
                    env: Some(env),
                    ..Default::default()
                },
            )
            .await?;
        Ok(release.id)
    }
}

impl Provider {
    /// Point the app stack at the release and detach a waiter for the outcome.
    async fn start_promotion(&self, app: &str, id: &str) -> ProviderResult<()> {
        let app = self.app_get(app).await?;
        let release = self.release_get(&app.name, id).await?;
        let bucket = self.app_resource(&app.name, "Settings").await?;
        let key = template_key(id);

        let objects = &self.substrate().objects;
        if app.is_gen2() || !self.call(objects.exists(&bucket, &key)).await? {
            let services = ServiceIndex::parse(&release.manifest);
            let template = self.renderer().app(&AppTemplate {
                app: &app.name,
                generation: &app.generation,
                release: Some(id),
                services: &services,
                version: &self.config().version,
            })?;
            self.call(objects.put(&bucket, &key, template.into_bytes(), false))
                .await?;
        } else {
            debug!(app = %app.name, release = %id, "using stored template");
        }

        let mut changes = BTreeMap::from([("LogBucket".to_string(), self.config().log_bucket.clone())]);
        if !app.is_gen2() {
            changes.insert("Release".to_string(), id.to_string());
        }

        let stack = self.rack_stack(&app.name);
        self.update_stack(&stack, Some(&format!("object://{}/{key}", app.name)), &changes)
            .await?;
        info!(app = %app.name, release = %id, "release promotion started");

        let waiter = self.with_context(CallContext::new());
        let (app_name, id) = (app.name.clone(), id.to_string());
        tokio::spawn(async move {
            waiter.wait_for_promotion(&app_name, &stack, &id).await;
        });
        Ok(())
    }

    /// Newest release of an app, env included.
    pub async fn latest_release(&self, app: &str) -> ProviderResult<Option<Release>> {
        match self.release_list(app, 1).await?.into_iter().next() {
            Some(latest) => Ok(Some(self.release_get(app, &latest.id).await?)),
            None => Ok(None),
        }
    }

    /// Watch the app stack settle and publish the promotion outcome.
    async fn wait_for_promotion(&self, app: &str, stack: &str, id: &str) {
        let event = Event::new("release:promote").with("app", app).with("id", id);
        let outcome = self.promotion_outcome(stack, id).await;
        match &outcome {
            Ok(()) => info!(%app, release = %id, "release promoted"),
            Err(e) => warn!(%app, release = %id, error = %e, "release promotion failed"),
        }
        self.notify(event, outcome.as_ref().err()).await;
    }

    async fn promotion_outcome(&self, stack: &str, id: &str) -> ProviderResult<()> {
        let fresh = self.without_cache();
        let deadline = tokio::time::Instant::now() + PROMOTION_TIMEOUT;

        let status = loop {
            self.clear_stack_cache(stack);
            let current = fresh
                .describe_stack(stack)
                .await
                .map_err(|e| ProviderError::internal(format!("unable to check stack status: {e}")))?;
            if !is_settling(&current.status) {
                break current.status;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProviderError::Timeout(
                    "couldn't determine promotion status, timed out".to_string(),
                ));
            }
            if !self.context().sleep(PROMOTION_POLL).await {
                return Err(ProviderError::Canceled);
            }
        };

        if status.ends_with("_COMPLETE") && !status.contains("ROLLBACK") {
            return Ok(());
        }

        let events = fresh
            .describe_stack_events(stack)
            .await
            .map_err(|e| ProviderError::internal(format!("unable to check stack events: {e}")))?;
        let reason = events
            .iter()
            .rev()
            .find(|e| e.status.ends_with("_FAILED"))
            .map(|e| format!("[{}:{}] [{}]: {}", e.resource_type, e.logical_id, e.status, e.reason))
            .unwrap_or_else(|| "unable to determine release error".to_string());
        Err(ProviderError::internal(format!("release {id} failed - {reason}")))
    }
}
