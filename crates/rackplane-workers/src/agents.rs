//! Agent scaler: agent services run once per instance, so their count
//! tracks the rack's instance count.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rack_core::{App, ServiceIndex};
use rackplane_provider::render::upper_name;
use rackplane_provider::{AppOps, Provider};
use tracing::{info, warn};

use crate::runner::Worker;

pub const AGENTS_INTERVAL: Duration = Duration::from_secs(60);

/// Count parameters of `app` that differ from `instances`.
fn agent_changes(app: &App, manifest: &str, instances: &str) -> BTreeMap<String, String> {
    ServiceIndex::parse(manifest)
        .agents()
        .map(|service| format!("{}Count", upper_name(service)))
        .filter(|key| app.parameters.get(key).is_some_and(|current| current != instances))
        .map(|key| (key, instances.to_string()))
        .collect()
}

pub struct AgentScaler {
    provider: Provider,
}

impl AgentScaler {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider: provider.without_cache(),
        }
    }

    async fn scale_app(&self, app: &App, instances: &str) -> anyhow::Result<()> {
        let Some(release) = self.provider.latest_release(&app.name).await? else {
            return Ok(());
        };
        let changes = agent_changes(app, &release.manifest, instances);
        if changes.is_empty() {
            return Ok(());
        }
        self.provider
            .update_stack(&self.provider.rack_stack(&app.name), None, &changes)
            .await?;
        info!(app = %app.name, ?changes, "agent counts updated");
        Ok(())
    }
}

#[async_trait]
impl Worker for AgentScaler {
    fn name(&self) -> &'static str {
        "agents"
    }

    fn interval(&self) -> Duration {
        AGENTS_INTERVAL
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let rack = self.provider.rack_stack_info().await?;
        let Some(instances) = rack.parameters.get("InstanceCount") else {
            anyhow::bail!("rack has no InstanceCount parameter");
        };

        for app in self.provider.app_list().await? {
            if app.status != "running" {
                continue;
            }
            if let Err(e) = self.scale_app(&app, instances).await {
                warn!(app = %app.name, error = %e, "agent scaling failed");
            }
        }
        Ok(())
    }
}
