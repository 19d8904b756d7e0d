//! Instance monitor: scaling-group members whose scheduler agent is gone.
//!
//! An `InService` instance without a connected agent is noted on the first
//! tick and marked Unhealthy on the second consecutive one, which makes the
//! scaling group replace it.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use rackplane_provider::Provider;
use tracing::{debug, info, warn};

use crate::runner::Worker;

pub const MONITOR_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct Monitor {
    provider: Provider,
    disconnected: BTreeSet<String>,
}

impl Monitor {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider: provider.without_cache(),
            disconnected: BTreeSet::new(),
        }
    }

    /// Agent state per `InService` group member; absent agents count as
    /// disconnected.
    async fn in_service_agents(&self) -> anyhow::Result<BTreeMap<String, bool>> {
        let config = self.provider.config();
        let group = self.provider.stack_resource(&config.rack, "Instances").await?;
        let groups = self
            .provider
            .call(self.provider.substrate().scaling.describe_groups(std::slice::from_ref(&group)))
            .await?;

        let mut agents: BTreeMap<String, bool> = groups
            .iter()
            .flat_map(|g| &g.instances)
            .filter(|i| i.lifecycle_state == "InService")
            .map(|i| (i.id.clone(), false))
            .collect();

        for ci in self.provider.container_instances(&config.cluster).await? {
            if let Some(connected) = agents.get_mut(&ci.ec2_instance_id) {
                *connected = ci.agent_connected;
            }
        }
        Ok(agents)
    }
}

#[async_trait]
impl Worker for Monitor {
    fn name(&self) -> &'static str {
        "monitor"
    }

    fn interval(&self) -> Duration {
        MONITOR_INTERVAL
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let agents = self.in_service_agents().await?;
        let scaling = &self.provider.substrate().scaling;

        for (id, connected) in &agents {
            if *connected {
                self.disconnected.remove(id);
                continue;
            }
            if self.disconnected.insert(id.clone()) {
                info!(instance = %id, "instance missed its first heartbeat");
                continue;
            }
            match self.provider.call(scaling.set_instance_health(id, "Unhealthy", true)).await {
                Ok(()) => {
                    info!(instance = %id, "instance marked unhealthy, agent disconnected");
                    self.disconnected.remove(id);
                }
                Err(e) => warn!(instance = %id, error = %e, "could not mark instance unhealthy"),
            }
        }

        self.disconnected.retain(|id| agents.contains_key(id));
        debug!(count = agents.len(), tracked = self.disconnected.len(), "instances checked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rackplane_provider::testing::TestRack;
    use rackplane_substrate::ContainerInstance;

    fn agent(rack: &TestRack, id: &str, connected: bool) {
        rack.cloud.scheduler.add_container_instance(
            "convox-cluster",
            ContainerInstance {
                arn: format!("arn:aws:ecs:us-east-1:000000000000:container-instance/{id}"),
                ec2_instance_id: id.to_string(),
                agent_connected: connected,
                status: "ACTIVE".to_string(),
                registered_cpu: 1024,
                registered_memory: 2000,
                remaining_cpu: 1024,
                remaining_memory: 2000,
                running_tasks: 0,
                registered_at: None,
            },
        );
    }

    #[tokio::test]
    async fn second_disconnected_sighting_marks_unhealthy() {
        let rack = TestRack::new();
        rack.seed_rack();
        agent(&rack, "i-1", true);
        agent(&rack, "i-2", false);
        agent(&rack, "i-3", true);

        let mut monitor = Monitor::new(rack.provider.clone());
        monitor.tick().await.unwrap();
        assert!(rack.cloud.scaling.health_calls().is_empty());

        monitor.tick().await.unwrap();
        assert_eq!(
            rack.cloud.scaling.health_calls(),
            [("i-2".to_string(), "Unhealthy".to_string())]
        );
    }

    #[tokio::test]
    async fn reconnecting_resets_the_count() {
        let rack = TestRack::new();
        rack.seed_rack();
        agent(&rack, "i-1", false);
        agent(&rack, "i-2", true);
        agent(&rack, "i-3", true);

        let mut monitor = Monitor::new(rack.provider.clone());
        monitor.tick().await.unwrap();
        rack.cloud.scheduler.set_agent_connected("i-1", true);
        monitor.tick().await.unwrap();
        rack.cloud.scheduler.set_agent_connected("i-1", false);
        monitor.tick().await.unwrap();

        assert!(rack.cloud.scaling.health_calls().is_empty());
    }

    #[tokio::test]
    async fn unregistered_instances_count_as_disconnected() {
        let rack = TestRack::new();
        rack.seed_rack();
        agent(&rack, "i-1", true);
        agent(&rack, "i-2", true);

        let mut monitor = Monitor::new(rack.provider.clone());
        monitor.tick().await.unwrap();
        monitor.tick().await.unwrap();

        assert_eq!(
            rack.cloud.scaling.health_calls(),
            [("i-3".to_string(), "Unhealthy".to_string())]
        );
    }
}
