//! Spot replacement: spot instances carry everything above the on-demand
//! floor, and on-demand instances cover whatever spot cannot.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rackplane_provider::{Provider, SystemOps};
use rackplane_substrate::ScalingGroup;
use tracing::{debug, info};

use crate::runner::Worker;

pub const SPOT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpotPlan {
    pub spot: i64,
    pub on_demand: i64,
}

/// Desired sizes for `instances` total with `on_demand_min` reserved for
/// on-demand and `spot_healthy` spot instances already serving.
pub fn plan(instances: i64, on_demand_min: i64, spot_healthy: i64) -> SpotPlan {
    SpotPlan {
        spot: (instances - on_demand_min).max(0),
        on_demand: (instances - spot_healthy).max(0),
    }
}

fn healthy(group: &ScalingGroup) -> i64 {
    group
        .instances
        .iter()
        .filter(|i| i.lifecycle_state == "InService" && i.health_status == "Healthy")
        .count() as i64
}

pub struct SpotReplace {
    provider: Provider,
    on_demand_min: u32,
}

impl SpotReplace {
    pub fn new(provider: Provider, on_demand_min: u32) -> Self {
        Self {
            provider: provider.without_cache(),
            on_demand_min,
        }
    }

    async fn group(&self, logical: &str) -> anyhow::Result<ScalingGroup> {
        let name = self.provider.stack_resource(&self.provider.config().rack, logical).await?;
        self.provider
            .call(self.provider.substrate().scaling.describe_groups(std::slice::from_ref(&name)))
            .await?
            .into_iter()
            .next()
            .with_context(|| format!("no such scaling group: {name}"))
    }

    async fn resize(&self, group: &ScalingGroup, desired: i64) -> anyhow::Result<()> {
        if group.desired_capacity == desired {
            return Ok(());
        }
        info!(group = %group.name, from = group.desired_capacity, to = desired, "setting desired capacity");
        self.provider
            .call(self.provider.substrate().scaling.set_desired_capacity(&group.name, desired))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Worker for SpotReplace {
    fn name(&self) -> &'static str {
        "spot-replace"
    }

    fn interval(&self) -> Duration {
        SPOT_INTERVAL
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let system = self.provider.system_get().await?;
        if !matches!(system.status.as_str(), "running" | "converging") {
            debug!(status = %system.status, "rack not settled, skipping");
            return Ok(());
        }

        let on_demand = self.group("Instances").await?;
        let spot = self.group("SpotInstances").await?;
        let plan = plan(i64::from(system.count), i64::from(self.on_demand_min), healthy(&spot));
        debug!(
            count = system.count,
            on_demand_min = self.on_demand_min,
            on_demand_healthy = healthy(&on_demand),
            spot_healthy = healthy(&spot),
            ?plan,
            "spot plan"
        );

        self.resize(&spot, plan.spot).await?;
        self.resize(&on_demand, plan.on_demand).await?;
        Ok(())
    }
}
