//! Addon resources, one stack per resource named `{rack}-{name}`.
//!
//! Links live in the resource stack itself: each linked app contributes a
//! `{App}Link` output whose value is the app's log group.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rack_core::{Event, Resource, ResourceType};
use rackplane_substrate::{CreateStackRequest, Stack, TemplateSource};
use sha2::{Digest, Sha256};
use tracing::info;
use url::Url;

use crate::error::{ProviderError, ProviderResult};
use crate::ops::{AppOps, ResourceOps};
use crate::provider::Provider;
use crate::render::{Provisioning, ResourceKind, ResourceTemplate, resource_kind, upper_name};
use crate::stack::human_status;

const PASSWORD_LENGTH: usize = 30;

/// Caller parameter names are accepted in any case style: `queue-name` → `QueueName`.
fn stack_params(params: BTreeMap<String, String>) -> BTreeMap<String, String> {
    params.into_iter().map(|(k, v)| (upper_name(&k), v)).collect()
}

fn generate_password() -> String {
    let seed: [u8; 32] = rand::random();
    let mut hex = hex::encode(Sha256::digest(seed));
    hex.truncate(PASSWORD_LENGTH);
    hex
}

fn check_url(kind: &ResourceKind, url: Option<&String>) -> ProviderResult<()> {
    let Provisioning::Url(schemes) = kind.provisioning else {
        return Ok(());
    };
    let raw = url
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ProviderError::validation("Must specify a URL"))?;
    let parsed = Url::parse(raw).map_err(|e| ProviderError::validation(format!("invalid url: {e}")))?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(ProviderError::validation(format!(
            "Invalid URL scheme: {}. Allowed schemes are: {}",
            parsed.scheme(),
            schemes.join(", ")
        )));
    }
    Ok(())
}

/// App named by a linked log group: `{rack}-{app}-LogGroup-…`.
fn linked_app(rack: &str, log_group: &str) -> Option<String> {
    let head = &log_group[..log_group.find("-LogGroup")?];
    let app = head.strip_prefix(&format!("{rack}-")).unwrap_or(head);
    (!app.is_empty()).then(|| app.to_string())
}

/// Connection URL a resource exports to linked apps.
fn export_url(kind: &str, outputs: &BTreeMap<String, String>, params: &BTreeMap<String, String>) -> String {
    let out = |key: &str| outputs.get(key).map(String::as_str).unwrap_or_default();
    match kind {
        "memcached" => format!("{}:{}", out("Port11211TcpAddr"), out("Port11211TcpPort")),
        "mysql" => format!(
            "mysql://{}:{}@{}:{}/{}",
            out("EnvMysqlUsername"),
            out("EnvMysqlPassword"),
            out("Port3306TcpAddr"),
            out("Port3306TcpPort"),
            out("EnvMysqlDatabase")
        ),
        "postgres" => format!(
            "postgres://{}:{}@{}:{}/{}",
            out("EnvPostgresUsername"),
            out("EnvPostgresPassword"),
            out("Port5432TcpAddr"),
            out("Port5432TcpPort"),
            out("EnvPostgresDatabase")
        ),
        "redis" => format!(
            "redis://{}:{}/{}",
            out("Port6379TcpAddr"),
            out("Port6379TcpPort"),
            out("EnvRedisDatabase")
        ),
        "s3" => format!("s3://{}:{}@{}", out("AccessKey"), out("SecretAccessKey"), out("Bucket")),
        "sns" => format!("sns://{}:{}@{}", out("AccessKey"), out("SecretAccessKey"), out("Topic")),
        "sqs" => match Url::parse(out("Queue")) {
            Ok(queue) => format!(
                "sqs://{}:{}@{}{}",
                out("AccessKey"),
                out("SecretAccessKey"),
                queue.host_str().unwrap_or_default(),
                queue.path()
            ),
            Err(_) => String::new(),
        },
        "webhook" => params
            .get("Url")
            .and_then(|u| Url::parse(u).ok())
            .and_then(|u| u.query_pairs().find(|(k, _)| k == "endpoint").map(|(_, v)| v.into_owned()))
            .unwrap_or_default(),
        _ => params.get("Url").cloned().unwrap_or_default(),
    }
}

#[async_trait]
impl ResourceOps for Provider {
    async fn resource_create(&self, name: &str, kind: &str, params: BTreeMap<String, String>) -> ProviderResult<Resource> {
        match self.resource_get(name).await {
            Ok(_) => return Err(ProviderError::Conflict(format!("resource named {name} already exists"))),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let result = self.create_resource_stack(name, kind, stack_params(params)).await;
        let event = Event::new("resource:create").with("name", name).with("type", kind);
        self.notify(event, result.as_ref().err()).await;
        result?;

        info!(resource = %name, %kind, "resource created");
        self.resource_get(name).await
    }

    async fn resource_get(&self, name: &str) -> ProviderResult<Resource> {
        let rack = &self.config().rack;
        let stack = match self.describe_stack(&format!("{rack}-{name}")).await {
            Ok(stack) => stack,
            Err(e) if e.is_not_found() => self.describe_stack(name).await.map_err(|e| match e {
                e if e.is_not_found() => ProviderError::not_found(format!("no such resource: {name}")),
                e => e,
            })?,
            Err(e) => return Err(e),
        };
        if !is_resource_stack(&stack, rack) {
            return Err(ProviderError::not_found(format!("no such resource: {name}")));
        }

        let mut resource = resource_from_stack(&stack);
        resource.apps = self.resource_apps(&resource).await?;
        Ok(resource)
    }

    async fn resource_list(&self) -> ProviderResult<Vec<Resource>> {
        let rack = &self.config().rack;
        let mut resources: Vec<Resource> = self
            .describe_stacks(None)
            .await?
            .iter()
            .filter(|s| is_resource_stack(s, rack))
            .map(resource_from_stack)
            .collect();
        for resource in &mut resources {
            resource.apps = self.resource_apps(resource).await?;
        }
        resources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(resources)
    }

    async fn resource_update(&self, name: &str, params: BTreeMap<String, String>) -> ProviderResult<Resource> {
        let resource = self.resource_get(name).await?;
        let kind = known_kind(&resource.kind)?;

        let mut changes = stack_params(params);
        if changes.contains_key("Url") {
            check_url(kind, changes.get("Url"))?;
            self.rewrite_url(kind, &mut changes);
        }

        let body = self.render_resource(&resource, &self.resource_links(&resource))?;
        let result = self.update_stack_body(&resource.stack, body, &changes).await;
        let event = Event::new("resource:update").with("name", name).with("type", &resource.kind);
        self.notify(event, result.as_ref().err()).await;
        result?;

        info!(resource = %name, changes = changes.len(), "resource updated");
        self.resource_get(name).await
    }

    async fn resource_delete(&self, name: &str) -> ProviderResult<Resource> {
        let resource = self.resource_get(name).await?;
        if let Some(app) = resource.apps.first() {
            return Err(ProviderError::InUse(format!("resource is linked to {app}")));
        }

        let result = self.delete_stack(&resource.stack).await;
        let event = Event::new("resource:delete").with("name", name).with("type", &resource.kind);
        self.notify(event, result.as_ref().err()).await;
        result?;

        info!(resource = %name, "resource deleted");
        Ok(resource)
    }

    async fn resource_link(&self, name: &str, app: &str) -> ProviderResult<Resource> {
        let app = self.app_get(app).await?;
        let resource = self.resource_get(name).await?;
        if resource.apps.contains(&app.name) {
            return Err(ProviderError::Conflict(format!(
                "resource {} is already linked to app {}",
                resource.name, app.name
            )));
        }
        link_strategy(&resource)?;

        let log_group = self.app_resource(&app.name, "LogGroup").await?;
        let mut links = self.resource_links(&resource);
        links.push((app.name.clone(), log_group));

        let body = self.render_resource(&resource, &links)?;
        let result = self.update_stack_body(&resource.stack, body, &BTreeMap::new()).await;
        let event = Event::new("resource:link").with("name", name).with("app", &app.name);
        self.notify(event, result.as_ref().err()).await;
        result?;

        info!(resource = %name, app = %app.name, "resource linked");
        self.resource_get(name).await
    }

    async fn resource_unlink(&self, name: &str, app: &str) -> ProviderResult<Resource> {
        let app = self.app_get(app).await?;
        let resource = self.resource_get(name).await?;
        if !resource.apps.contains(&app.name) {
            return Err(ProviderError::validation(format!(
                "resource {} is not linked to app {}",
                resource.name, app.name
            )));
        }
        link_strategy(&resource)?;

        let links: Vec<(String, String)> = self
            .resource_links(&resource)
            .into_iter()
            .filter(|(linked, _)| linked != &app.name)
            .collect();

        let body = self.render_resource(&resource, &links)?;
        let result = self.update_stack_body(&resource.stack, body, &BTreeMap::new()).await;
        let event = Event::new("resource:unlink").with("name", name).with("app", &app.name);
        self.notify(event, result.as_ref().err()).await;
        result?;

        info!(resource = %name, app = %app.name, "resource unlinked");
        self.resource_get(name).await
    }

    fn resource_types(&self) -> Vec<ResourceType> {
        self.renderer().resource_types()
    }
}

fn known_kind(kind: &str) -> ProviderResult<&'static ResourceKind> {
    resource_kind(kind).ok_or_else(|| ProviderError::validation(format!("Invalid resource type: {kind}")))
}

fn link_strategy(resource: &Resource) -> ProviderResult<()> {
    match resource_kind(&resource.kind) {
        Some(kind) if kind.links_logs => Ok(()),
        _ => Err(ProviderError::validation(format!(
            "resource type {} does not have a link strategy",
            resource.kind
        ))),
    }
}

fn is_resource_stack(stack: &Stack, rack: &str) -> bool {
    let tag = |key: &str| stack.tags.get(key).map(String::as_str).unwrap_or_default();
    tag("System") == "convox"
        && matches!(tag("Type"), "resource" | "service")
        && (tag("Rack").is_empty() || tag("Rack") == rack)
}

fn resource_from_stack(stack: &Stack) -> Resource {
    let kind = stack
        .tags
        .get("Resource")
        .or_else(|| stack.tags.get("Service"))
        .cloned()
        .unwrap_or_default();
    let name = stack
        .tags
        .get("Name")
        .filter(|n| !n.is_empty())
        .cloned()
        .unwrap_or_else(|| stack.name.clone());
    Resource {
        url: export_url(&kind, &stack.outputs, &stack.parameters),
        name,
        kind,
        status: human_status(&stack.status).to_string(),
        stack: stack.name.clone(),
        apps: Vec::new(),
        outputs: stack.outputs.clone(),
        parameters: stack.parameters.clone(),
        tags: stack.tags.clone(),
    }
}

impl Provider {
    async fn create_resource_stack(&self, name: &str, kind: &str, mut params: BTreeMap<String, String>) -> ProviderResult<()> {
        let config = self.config();
        let spec = known_kind(kind)?;
        let rack = &config.rack;

        match kind {
            "s3" | "sns" => {
                let key = if kind == "s3" { "Topic" } else { "Queue" };
                if let Some(target) = params.get_mut(key).filter(|t| !t.is_empty()) {
                    *target = format!("{rack}-{target}");
                }
            }
            "syslog" => {
                params.insert("Private".to_string(), (!config.subnets_private.is_empty()).to_string());
            }
            _ => {}
        }
        check_url(spec, params.get("Url"))?;
        self.rewrite_url(spec, &mut params);

        let subnets_private = if config.subnets_private.is_empty() {
            &config.subnets
        } else {
            &config.subnets_private
        };
        for (key, value) in [
            ("CustomTopic", config.custom_topic.as_str()),
            ("NotificationTopic", config.notification_topic.as_str()),
            ("SecurityGroups", config.security_group.as_str()),
            ("Subnets", config.subnets.as_str()),
            ("SubnetsPrivate", subnets_private.as_str()),
            ("Vpc", config.vpc.as_str()),
            ("VpcCidr", config.vpc_cidr.as_str()),
        ] {
            params.insert(key.to_string(), value.to_string());
        }
        params.insert("Password".to_string(), generate_password());

        let stack = format!("{rack}-{name}");
        let body = self.renderer().resource(&ResourceTemplate {
            stack: &stack,
            kind,
            links: &[],
        })?;
        let allowed = crate::render::template_parameters(&body)?;
        params.retain(|key, _| allowed.contains_key(key));

        let tags = BTreeMap::from([
            ("Name".to_string(), name.to_string()),
            ("Rack".to_string(), rack.clone()),
            ("Resource".to_string(), kind.to_string()),
            ("System".to_string(), "convox".to_string()),
            ("Type".to_string(), "resource".to_string()),
        ]);
        let topic = &config.notification_topic;
        self.create_stack(CreateStackRequest {
            name: stack,
            template: TemplateSource::Body(body),
            parameters: params,
            tags,
            notification_topic: (!topic.is_empty()).then(|| topic.clone()),
        })
        .await?;
        Ok(())
    }

    /// Webhooks are delivered through the rack's notification relay.
    fn rewrite_url(&self, kind: &ResourceKind, params: &mut BTreeMap<String, String>) {
        if kind.name != "webhook" {
            return;
        }
        if let Some(url) = params.get_mut("Url") {
            let endpoint: String = url::form_urlencoded::byte_serialize(url.as_bytes()).collect();
            *url = format!("http://{}/sns?endpoint={endpoint}", self.config().notification_host);
        }
    }

    fn render_resource(&self, resource: &Resource, links: &[(String, String)]) -> ProviderResult<String> {
        self.renderer().resource(&ResourceTemplate {
            stack: &resource.stack,
            kind: &resource.kind,
            links,
        })
    }

    /// Current links as `(app, log group)`, read from `{App}Link` outputs.
    fn resource_links(&self, resource: &Resource) -> Vec<(String, String)> {
        let rack = &self.config().rack;
        resource
            .outputs
            .iter()
            .filter(|(key, _)| key.ends_with("Link"))
            .filter_map(|(_, group)| linked_app(rack, group).map(|app| (app, group.clone())))
            .collect()
    }

    /// Linked apps that still exist.
    async fn resource_apps(&self, resource: &Resource) -> ProviderResult<Vec<String>> {
        let mut apps = Vec::new();
        for (app, _) in self.resource_links(resource) {
            match self.app_get(&app).await {
                Ok(app) => apps.push(app.name),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(apps)
    }
}
