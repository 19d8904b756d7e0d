//! App lifecycle: one stack per app, named `{rack}-{app}`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rack_core::{App, AppCreateOptions, Event, LogsOptions, ServiceIndex};
use rackplane_stream::PipeReader;
use rackplane_substrate::tables::{BATCH_DELETE_LIMIT, item_id};
use rackplane_substrate::{CreateStackRequest, TemplateSource};
use tracing::{debug, error, info, warn};

use crate::error::{ProviderError, ProviderResult};
use crate::ops::{AppOps, ResourceOps};
use crate::provider::Provider;
use crate::render::AppTemplate;
use crate::stack::app_from_stack;

const DEFAULT_GENERATION: &str = "2";

/// How often cleanup re-checks a deleting stack, and how many times.
const CLEANUP_POLL: Duration = Duration::from_secs(10);
const CLEANUP_ATTEMPTS: usize = 60;

#[async_trait]
impl AppOps for Provider {
    async fn app_cancel(&self, name: &str) -> ProviderResult<()> {
        let stack = self.rack_stack(name);
        self.clear_stack_cache(&stack);
        let result = self.call(self.substrate().stacks.cancel_update_stack(&stack)).await;
        self.clear_stack_cache(&stack);
        match result {
            Ok(()) => {
                info!(app = %name, "stack update canceled");
                Ok(())
            }
            Err(e) if e.is_missing_stack() => Err(ProviderError::not_found(format!("{name} not found"))),
            Err(e) if e.is_code("ValidationError") => Err(ProviderError::Conflict(format!("{name} is not updating"))),
            Err(e) => Err(e.into()),
        }
    }

    async fn app_create(&self, name: &str, opts: AppCreateOptions) -> ProviderResult<App> {
        let result = self.create_app_stack(name, opts).await;
        let event = Event::new("app:create").with("name", name);
        self.notify(event, result.as_ref().err()).await;
        result?;

        self.app_get(name).await
    }

    async fn app_get(&self, name: &str) -> ProviderResult<App> {
        let rack = &self.config().rack;
        let not_found = || ProviderError::not_found(format!("{name} not found"));

        match self.describe_stack(&self.rack_stack(name)).await {
            Ok(stack) => {
                let app = app_from_stack(&stack);
                match app.tags.get("Rack") {
                    Some(tag) if !tag.is_empty() && tag != rack => Err(not_found()),
                    _ => Ok(app),
                }
            }
            Err(e) if e.is_not_found() => {
                // Stacks created before the rack prefix existed carry the bare name.
                let stack = self.describe_stack(name).await.map_err(|e| match e {
                    e if e.is_not_found() => not_found(),
                    e => e,
                })?;
                let app = app_from_stack(&stack);
                if app.tags.get("Rack") == Some(rack) {
                    Ok(app)
                } else {
                    Err(not_found())
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn app_list(&self) -> ProviderResult<Vec<App>> {
        let rack = &self.config().rack;
        let apps = self
            .describe_stacks(None)
            .await?
            .iter()
            .filter(|s| {
                s.tags.get("System").map(String::as_str) == Some("convox")
                    && s.tags.get("Type").map(String::as_str) == Some("app")
                    && s.tags.get("Rack") == Some(rack)
            })
            .map(app_from_stack)
            .collect();
        Ok(apps)
    }

    async fn app_delete(&self, name: &str) -> ProviderResult<()> {
        let result = self.delete_app_stack(name).await;
        let event = Event::new("app:delete").with("name", name);
        self.notify(event, result.as_ref().err()).await;
        result
    }

    async fn app_logs(&self, name: &str, opts: LogsOptions) -> ProviderResult<PipeReader> {
        let group = self.app_resource(name, "LogGroup").await?;
        Ok(self.subscribe_logs(group, opts))
    }
}

// ── Creation ───────────────────────────────────────────────────

impl Provider {
    async fn create_app_stack(&self, name: &str, opts: AppCreateOptions) -> ProviderResult<()> {
        let generation = opts
            .generation
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| DEFAULT_GENERATION.to_string());
        if generation != "1" && generation != "2" {
            return Err(ProviderError::validation(format!("unknown generation: {generation}")));
        }

        let config = self.config();
        let body = self.renderer().app(&AppTemplate {
            app: name,
            generation: &generation,
            release: None,
            services: &ServiceIndex::default(),
            version: &config.version,
        })?;

        let subnets_private = if config.subnets_private.is_empty() {
            config.subnets.clone()
        } else {
            config.subnets_private.clone()
        };
        let parameters = BTreeMap::from([
            ("LogBucket".to_string(), config.log_bucket.clone()),
            ("Private".to_string(), if config.internal { "Yes" } else { "No" }.to_string()),
            ("Rack".to_string(), config.rack.clone()),
            ("Subnets".to_string(), config.subnets.clone()),
            ("SubnetsPrivate".to_string(), subnets_private),
            ("Version".to_string(), config.version.clone()),
        ]);
        let tags = BTreeMap::from([
            ("Generation".to_string(), generation.clone()),
            ("Name".to_string(), name.to_string()),
            ("Rack".to_string(), config.rack.clone()),
            ("System".to_string(), "convox".to_string()),
            ("Type".to_string(), "app".to_string()),
            ("Version".to_string(), config.version.clone()),
        ]);

        let topic = &config.notification_topic;
        let req = CreateStackRequest {
            name: self.rack_stack(name),
            template: TemplateSource::Body(body),
            parameters,
            tags,
            notification_topic: (!topic.is_empty()).then(|| topic.clone()),
        };

        match self.create_stack(req).await {
            Ok(_) => {}
            Err(ProviderError::Internal(message)) if message.contains("AlreadyExistsException") => {
                return Err(ProviderError::Conflict(format!("app already exists: {name}")));
            }
            Err(e) => return Err(e),
        }

        info!(app = %name, %generation, "app created");
        Ok(())
    }

    async fn delete_app_stack(&self, name: &str) -> ProviderResult<()> {
        let app = self.app_get(name).await?;

        for resource in self.resource_list().await? {
            if resource.apps.iter().any(|a| a == name) {
                return Err(ProviderError::InUse(format!("app is linked to {} resource", resource.name)));
            }
        }

        let stack = self.rack_stack(&app.name);
        let settings = self.app_resource(&app.name, "Settings").await.ok();
        let repository = match self.app_resource(&app.name, "Registry").await {
            Ok(repo) => Some(repo),
            Err(_) => Some(app.output("RegistryRepository").to_string()).filter(|r| !r.is_empty()),
        };

        self.delete_stack(&stack).await?;
        info!(app = %name, "app deleted");

        let provider = self.clone();
        let cleanup = AppCleanup {
            app,
            settings,
            repository,
        };
        tokio::spawn(async move {
            if let Err(e) = provider.cleanup_app(cleanup).await {
                error!(error = %e, "app cleanup failed");
            }
        });

        Ok(())
    }
}

// ── Cleanup ────────────────────────────────────────────────────────

/// What survives an app's stack and still has to go.
pub(crate) struct AppCleanup {
    pub app: App,
    pub settings: Option<String>,
    pub repository: Option<String>,
}

impl Provider {
    /// Delete the pieces the stack engine leaves behind, then watch the
    /// stack disappear, reissuing the delete once if it fails.
    pub(crate) async fn cleanup_app(&self, cleanup: AppCleanup) -> ProviderResult<()> {
        let name = cleanup.app.name.as_str();

        if let Some(bucket) = &cleanup.settings {
            self.call(self.substrate().objects.delete_bucket(bucket)).await?;
            debug!(app = %name, %bucket, "settings bucket deleted");
        }

        let config = self.config();
        self.delete_app_rows(&config.dynamo_builds, name).await?;

        match (&cleanup.repository, cleanup.app.output("RegistryId")) {
            (Some(repo), registry_id) if !registry_id.is_empty() => {
                if let Err(e) = self
                    .call(self.substrate().registry.delete_repository(registry_id, repo))
                    .await
                {
                    warn!(app = %name, repository = %repo, error = %e, "repository delete failed");
                }
            }
            _ => debug!(app = %name, "no registry repository to delete"),
        }

        self.delete_app_rows(&config.dynamo_releases, name).await?;

        let stack = self.rack_stack(name);
        let mut retried = false;
        for attempt in 0..CLEANUP_ATTEMPTS {
            match self.call(self.substrate().stacks.describe_stacks(Some(&stack))).await {
                Err(e) if e.is_missing_stack() => {
                    info!(app = %name, "app cleanup complete");
                    return Ok(());
                }
                Ok(stacks) if !retried && stacks.first().is_some_and(|s| s.status == "DELETE_FAILED") => {
                    warn!(app = %name, attempt, "stack delete failed, retrying");
                    if self.delete_stack(&stack).await.is_ok() {
                        retried = true;
                    }
                }
                _ => {}
            }
            if !self.context().sleep(CLEANUP_POLL).await {
                return Err(ProviderError::Canceled);
            }
        }

        warn!(app = %name, "stack still present after cleanup");
        Ok(())
    }

    /// Delete every row of `table` owned by `app`, in batches.
    pub(crate) async fn delete_app_rows(&self, table: &str, app: &str) -> ProviderResult<()> {
        let tables = &self.substrate().tables;
        let rows = self.call(tables.query_app(table, app, None, false)).await?;
        let ids: Vec<String> = rows.iter().filter_map(item_id).map(str::to_string).collect();
        for chunk in ids.chunks(BATCH_DELETE_LIMIT) {
            self.call(tables.batch_delete(table, chunk)).await?;
        }
        debug!(%app, %table, rows = ids.len(), "rows deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{BuildOps, ReleaseOps};
    use crate::testing::{TestRack, test_stack};
    use rack_core::{Build, Release};

    #[tokio::test]
    async fn get_returns_app_with_tags() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "1");

        let app = rack.provider.app_get("httpd").await.unwrap();
        assert_eq!(app.name, "httpd");
        assert_eq!(app.status, "running");
        assert_eq!(app.tags["Rack"], "convox");
        assert_eq!(app.generation, "1");
    }

    #[tokio::test]
    async fn get_falls_back_to_bare_stack_in_the_same_rack() {
        let rack = TestRack::new();
        let mut stack = test_stack("httpd", "CREATE_COMPLETE");
        stack.tags.insert("Rack".into(), "convox".into());
        stack.tags.insert("Name".into(), "httpd".into());
        rack.cloud.stacks.insert(stack, "{}");

        let app = rack.provider.app_get("httpd").await.unwrap();
        assert_eq!(app.name, "httpd");

        let mut other = test_stack("legacy", "CREATE_COMPLETE");
        other.tags.insert("Rack".into(), "staging".into());
        rack.cloud.stacks.insert(other, "{}");
        let err = rack.provider.app_get("legacy").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn get_rejects_other_racks() {
        let rack = TestRack::new();
        let mut stack = test_stack("convox-httpd", "CREATE_COMPLETE");
        stack.tags.insert("Rack".into(), "other".into());
        rack.cloud.stacks.insert(stack, "{}");

        let err = rack.provider.app_get("httpd").await.unwrap_err();
        assert_eq!(err.to_string(), "httpd not found");
    }

    #[tokio::test]
    async fn create_submits_tags_and_parameters() {
        let rack = TestRack::new();
        let app = rack.provider.app_create("httpd", AppCreateOptions::default()).await.unwrap();
        assert_eq!(app.generation, "2");

        let create = rack.cloud.stacks.creates().pop().unwrap();
        assert_eq!(create.name, "convox-httpd");
        assert_eq!(create.tags["Type"], "app");
        assert_eq!(create.tags["System"], "convox");
        assert_eq!(create.tags["Name"], "httpd");
        assert_eq!(create.parameters["SubnetsPrivate"], "subnet-a,subnet-b");
        assert_eq!(create.parameters["LogBucket"], "convox-logs");

        let published = rack.cloud.bus.published();
        assert_eq!(published.last().unwrap().subject, "app:create");

        let err = rack.provider.app_create("httpd", AppCreateOptions::default()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Conflict(ref m) if m == "app already exists: httpd"));

        let published = rack.cloud.bus.published();
        let last = published.last().unwrap();
        assert_eq!(last.subject, "app:create");
        let body: serde_json::Value = serde_json::from_str(&last.message).unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["data"]["message"], "app already exists: httpd");
    }

    #[tokio::test]
    async fn unknown_generation_is_rejected() {
        let rack = TestRack::new();
        let opts = AppCreateOptions {
            generation: Some("3".into()),
        };
        let err = rack.provider.app_create("httpd", opts).await.unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
        assert!(rack.cloud.stacks.creates().is_empty());
    }

    #[tokio::test]
    async fn list_filters_by_rack_and_type() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "2");
        rack.seed_app("worker", "1");
        let mut foreign = test_stack("convox-other", "CREATE_COMPLETE");
        foreign.tags.insert("Type".into(), "resource".into());
        rack.cloud.stacks.insert(foreign, "{}");

        let names: Vec<_> = rack
            .provider
            .app_list()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, ["httpd", "worker"]);
    }

    #[tokio::test]
    async fn cancel_requires_an_update_in_flight() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "2");

        let err = rack.provider.app_cancel("httpd").await.unwrap_err();
        assert!(matches!(err, ProviderError::Conflict(_)));

        rack.cloud.stacks.set_status("convox-httpd", "UPDATE_IN_PROGRESS");
        rack.provider.app_cancel("httpd").await.unwrap();
        assert_eq!(rack.cloud.stacks.get("convox-httpd").unwrap().status, "UPDATE_ROLLBACK_IN_PROGRESS");

        let err = rack.provider.app_cancel("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn second_delete_is_not_found() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "2");

        rack.provider.app_delete("httpd").await.unwrap();
        assert_eq!(rack.cloud.stacks.deletes(), ["convox-httpd"]);

        let err = rack.provider.app_delete("httpd").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn cleanup_removes_rows_bucket_and_repository() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "2");
        let p = &rack.provider;

        let bucket = p.app_resource("httpd", "Settings").await.unwrap();
        let repo = p.app_resource("httpd", "Registry").await.unwrap();
        p.substrate()
            .objects
            .put(&bucket, "templates/x.json", b"{}".to_vec(), false)
            .await
            .unwrap();
        for _ in 0..30 {
            p.build_save(&Build::new("httpd")).await.unwrap();
        }
        p.release_save(&Release::new("httpd")).await.unwrap();

        let app = p.app_get("httpd").await.unwrap();
        p.delete_stack("convox-httpd").await.unwrap();
        p.cleanup_app(AppCleanup {
            app,
            settings: Some(bucket.clone()),
            repository: Some(repo.clone()),
        })
        .await
        .unwrap();

        assert!(p.substrate().objects.list(&bucket, "").await.unwrap().is_empty());
        assert!(p.build_list("httpd", 100).await.unwrap().is_empty());
        assert!(p.release_list("httpd", 100).await.unwrap().is_empty());
        assert_eq!(rack.cloud.registry.deleted_repositories(), [(ACCOUNT_ID.to_string(), repo)]);
    }

    const ACCOUNT_ID: &str = crate::testing::ACCOUNT;
}
