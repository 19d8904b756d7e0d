//! Stack helpers: cached describes, status normalization, and the single
//! `update_stack` funnel every structural change goes through.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use rack_core::App;
use rackplane_substrate::{
    CreateStackRequest, ParameterValue, Stack, StackEvent, StackResource, TemplateSource, UpdateStackRequest,
    object_url,
};
use tracing::{debug, info, warn};

use crate::error::{ProviderError, ProviderResult};
use crate::provider::Provider;
use crate::render::template_parameters;

pub(crate) const DESCRIBE_STACKS: &str = "describeStacks";
pub(crate) const DESCRIBE_STACK_EVENTS: &str = "describeStackEvents";
pub(crate) const DESCRIBE_STACK_RESOURCES: &str = "describeStackResources";

const STACK_TTL: Duration = Duration::from_secs(5);

/// Map a raw stack status onto the human-facing set.
pub fn human_status(raw: &str) -> &'static str {
    match raw {
        "" => "new",
        "CREATE_IN_PROGRESS" => "creating",
        "CREATE_COMPLETE" => "running",
        "DELETE_FAILED" => "running",
        "DELETE_IN_PROGRESS" => "deleting",
        "ROLLBACK_IN_PROGRESS" => "rollback",
        "ROLLBACK_COMPLETE" => "failed",
        "UPDATE_IN_PROGRESS" => "updating",
        "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS" => "updating",
        "UPDATE_COMPLETE" => "running",
        "UPDATE_ROLLBACK_IN_PROGRESS" => "rollback",
        "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS" => "rollback",
        "UPDATE_ROLLBACK_COMPLETE" => "running",
        "UPDATE_ROLLBACK_FAILED" => "running",
        other => {
            warn!(status = %other, "unknown stack status");
            "unknown"
        }
    }
}

/// Whether a raw status is still moving.
pub(crate) fn is_settling(raw: &str) -> bool {
    raw.ends_with("_IN_PROGRESS")
}

pub(crate) fn app_from_stack(stack: &Stack) -> App {
    let name = stack.tags.get("Name").cloned().unwrap_or_else(|| stack.name.clone());
    let generation = stack
        .tags
        .get("Generation")
        .filter(|g| !g.is_empty())
        .cloned()
        .unwrap_or_else(|| "1".to_string());
    let release = stack
        .outputs
        .get("Release")
        .filter(|r| !r.is_empty())
        .or_else(|| stack.parameters.get("Release"))
        .cloned()
        .unwrap_or_default();

    App {
        name,
        generation,
        release,
        status: human_status(&stack.status).to_string(),
        outputs: stack.outputs.clone(),
        parameters: stack.parameters.clone(),
        tags: stack.tags.clone(),
    }
}

/// Split `object://{app}/{key}`.
pub(crate) fn parse_object_ref(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("object://")?;
    let (app, key) = rest.split_once('/')?;
    Some((app, key.trim_start_matches('/')))
}

impl Provider {
    // ── Reads ──────────────────────────────────────────────────────

    /// Every stack, or one stack by name. Cached briefly.
    pub(crate) async fn describe_stacks(&self, name: Option<&str>) -> ProviderResult<Vec<Stack>> {
        let stacks = self.substrate().stacks.clone();
        let owned = name.map(str::to_string);
        Ok(self
            .cached(DESCRIBE_STACKS, &name, STACK_TTL, async move {
                stacks.describe_stacks(owned.as_deref()).await
            })
            .await?)
    }

    pub async fn describe_stack(&self, name: &str) -> ProviderResult<Stack> {
        self.describe_stacks(Some(name))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::not_found(format!("stack not found: {name}")))
    }

    pub(crate) async fn describe_stack_events(&self, name: &str) -> ProviderResult<Vec<StackEvent>> {
        let stacks = self.substrate().stacks.clone();
        Ok(self
            .cached(DESCRIBE_STACK_EVENTS, name, STACK_TTL, async move {
                stacks.describe_stack_events(name).await
            })
            .await?)
    }

    pub(crate) async fn stack_resources(&self, name: &str) -> ProviderResult<Vec<StackResource>> {
        let stacks = self.substrate().stacks.clone();
        Ok(self
            .cached(DESCRIBE_STACK_RESOURCES, name, STACK_TTL, async move {
                stacks.describe_stack_resources(name).await
            })
            .await?)
    }

    /// Physical id of one logical resource in a stack.
    pub async fn stack_resource(&self, stack: &str, logical: &str) -> ProviderResult<String> {
        self.stack_resources(stack)
            .await?
            .into_iter()
            .find(|r| r.logical_id == logical)
            .map(|r| r.physical_id)
            .ok_or_else(|| ProviderError::not_found(format!("resource not found: {logical}")))
    }

    /// Physical id of a resource in an app's stack.
    pub async fn app_resource(&self, app: &str, logical: &str) -> ProviderResult<String> {
        self.stack_resource(&self.rack_stack(app), logical).await
    }

    /// The rack's own stack.
    pub async fn rack_stack_info(&self) -> ProviderResult<Stack> {
        self.describe_stack(&self.config().rack).await
    }

    // ── Writes ─────────────────────────────────────────────────────

    pub(crate) fn clear_stack_cache(&self, name: &str) {
        let cache = self.cache();
        cache.clear(DESCRIBE_STACKS, Some(&None::<&str>));
        cache.clear(DESCRIBE_STACKS, Some(&Some(name)));
        cache.clear(DESCRIBE_STACK_RESOURCES, Some(name));
        cache.clear(DESCRIBE_STACK_EVENTS, Some(name));
    }

    pub(crate) async fn create_stack(&self, req: CreateStackRequest) -> ProviderResult<String> {
        self.clear_stack_cache(&req.name);
        let name = req.name.clone();
        let id = self.call(self.substrate().stacks.create_stack(req)).await;
        self.clear_stack_cache(&name);
        let id = id?;
        info!(stack = %name, "stack created");
        Ok(id)
    }

    pub(crate) async fn delete_stack(&self, name: &str) -> ProviderResult<()> {
        self.clear_stack_cache(name);
        let result = self.call(self.substrate().stacks.delete_stack(name)).await;
        self.clear_stack_cache(name);
        result?;
        info!(stack = %name, "stack deleted");
        Ok(())
    }

    /// Update a stack, keeping every parameter not named in `changes`.
    ///
    /// `template` is an `object://{app}/{key}` reference; `None` keeps the
    /// current template. "No updates" is success; an in-flight update is a
    /// `Conflict`.
    pub async fn update_stack(
        &self,
        name: &str,
        template: Option<&str>,
        changes: &BTreeMap<String, String>,
    ) -> ProviderResult<()> {
        self.clear_stack_cache(name);

        let stack = self.without_cache().describe_stack(name).await?;

        let (source, allowed): (TemplateSource, BTreeSet<String>) = match template {
            Some(url) => {
                let (app, key) = parse_object_ref(url).ok_or_else(|| {
                    ProviderError::validation(format!("stack updates only support object:// urls: {url}"))
                })?;
                let bucket = self.app_resource(app, "Settings").await?;
                let body = self.call(self.substrate().objects.get(&bucket, key)).await?;
                let body = String::from_utf8(body)
                    .map_err(|_| ProviderError::validation("template is not valid utf-8"))?;
                let params = template_parameters(&body)?;
                (
                    TemplateSource::Url(object_url(&self.config().region, &bucket, key)),
                    params.into_keys().collect(),
                )
            }
            None => (TemplateSource::Previous, stack.parameters.keys().cloned().collect()),
        };

        self.submit_update(&stack, source, allowed, changes).await
    }

    /// Replace a stack's template with `body` under the same parameter rules
    /// as [`Provider::update_stack`].
    pub(crate) async fn update_stack_body(
        &self,
        name: &str,
        body: String,
        changes: &BTreeMap<String, String>,
    ) -> ProviderResult<()> {
        self.clear_stack_cache(name);
        let stack = self.without_cache().describe_stack(name).await?;
        let allowed = template_parameters(&body)?.into_keys().collect();
        self.submit_update(&stack, TemplateSource::Body(body), allowed, changes)
            .await
    }

    async fn submit_update(
        &self,
        stack: &Stack,
        source: TemplateSource,
        allowed: BTreeSet<String>,
        changes: &BTreeMap<String, String>,
    ) -> ProviderResult<()> {
        let name = stack.name.as_str();
        let parameters = allowed
            .iter()
            .map(|key| match changes.get(key) {
                Some(value) => ParameterValue::set(key, value),
                None => ParameterValue::previous(key),
            })
            .filter(|p| p.value.is_some() || stack.parameters.contains_key(&p.key))
            .collect();

        let topic = &self.config().notification_topic;
        let req = UpdateStackRequest {
            name: name.to_string(),
            template: source,
            parameters,
            notification_topic: (!topic.is_empty()).then(|| topic.clone()),
        };

        let result = self.call(self.substrate().stacks.update_stack(req)).await;
        self.clear_stack_cache(name);

        match result {
            Ok(()) => {
                info!(stack = %name, changes = changes.len(), "stack update submitted");
                Ok(())
            }
            Err(e) if e.message().contains("No updates are to be performed") => {
                debug!(stack = %name, "stack already up to date");
                Ok(())
            }
            Err(e) if e.message().contains("can not be updated") => {
                Err(ProviderError::Conflict(format!("{name} is already updating")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestRack, test_stack};

    #[test]
    fn statuses_normalize() {
        assert_eq!(human_status(""), "new");
        assert_eq!(human_status("CREATE_IN_PROGRESS"), "creating");
        assert_eq!(human_status("UPDATE_COMPLETE"), "running");
        assert_eq!(human_status("DELETE_FAILED"), "running");
        assert_eq!(human_status("UPDATE_ROLLBACK_FAILED"), "running");
        assert_eq!(human_status("ROLLBACK_COMPLETE"), "failed");
        assert_eq!(human_status("UPDATE_ROLLBACK_IN_PROGRESS"), "rollback");
        assert_eq!(human_status("IMPORT_IN_PROGRESS"), "unknown");
    }

    #[test]
    fn app_from_stack_prefers_tags_and_outputs() {
        let mut stack = test_stack("convox-httpd", "UPDATE_COMPLETE");
        stack.tags.insert("Name".into(), "httpd".into());
        stack.parameters.insert("Release".into(), "RPARAM".into());
        let app = app_from_stack(&stack);
        assert_eq!(app.name, "httpd");
        assert_eq!(app.generation, "1");
        assert_eq!(app.release, "RPARAM");
        assert_eq!(app.status, "running");

        stack.outputs.insert("Release".into(), "ROUTPUT".into());
        stack.tags.insert("Generation".into(), "2".into());
        let app = app_from_stack(&stack);
        assert_eq!(app.release, "ROUTPUT");
        assert!(app.is_gen2());
    }

    #[test]
    fn object_refs() {
        assert_eq!(parse_object_ref("object://httpd/templates/x.json"), Some(("httpd", "templates/x.json")));
        assert_eq!(parse_object_ref("https://example.com/x"), None);
    }

    #[tokio::test]
    async fn describe_is_cached_until_a_write() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "2");

        let before = rack.cloud.stacks.describe_calls();
        rack.provider.describe_stack("convox-httpd").await.unwrap();
        rack.provider.describe_stack("convox-httpd").await.unwrap();
        assert_eq!(rack.cloud.stacks.describe_calls(), before + 1);

        rack.provider
            .update_stack("convox-httpd", None, &BTreeMap::from([("WebCount".to_string(), "3".to_string())]))
            .await
            .unwrap();
        let cache = rack.provider.cache();
        assert!(cache.get::<Vec<Stack>, _>(DESCRIBE_STACKS, &None::<&str>).is_none());
        assert!(cache.get::<Vec<Stack>, _>(DESCRIBE_STACKS, &Some("convox-httpd")).is_none());
    }

    #[tokio::test]
    async fn update_keeps_unchanged_parameters_in_sorted_order() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "2");

        rack.provider
            .update_stack("convox-httpd", None, &BTreeMap::from([("WebCount".to_string(), "3".to_string())]))
            .await
            .unwrap();

        let update = rack.cloud.stacks.updates().pop().unwrap();
        assert_eq!(update.template, TemplateSource::Previous);
        let keys: Vec<_> = update.parameters.iter().map(|p| p.key.as_str()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        for p in &update.parameters {
            if p.key == "WebCount" {
                assert_eq!(p.value.as_deref(), Some("3"));
            } else {
                assert_eq!(p.value, None, "{} should keep its previous value", p.key);
            }
        }
    }

    #[tokio::test]
    async fn no_updates_is_success_and_in_flight_is_conflict() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "2");

        rack.provider.update_stack("convox-httpd", None, &BTreeMap::new()).await.unwrap();
        assert!(rack.cloud.stacks.updates().is_empty());

        rack.cloud.stacks.set_status("convox-httpd", "UPDATE_IN_PROGRESS");
        let err = rack
            .provider
            .update_stack("convox-httpd", None, &BTreeMap::from([("WebCount".to_string(), "2".to_string())]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Conflict(ref m) if m.contains("already updating")));
    }

    #[tokio::test]
    async fn template_updates_require_object_urls() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "2");
        let err = rack
            .provider
            .update_stack("convox-httpd", Some("https://example.com/t.json"), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
    }
}
