//! Rack instances: compute state merged with scheduler agent state.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rack_core::Instance;
use rand::Rng;
use tracing::info;

use crate::error::{ProviderError, ProviderResult};
use crate::ops::{InstanceOps, SettingsOps};
use crate::provider::Provider;

pub(crate) const INSTANCE_KEY_SETTING: &str = "instance-key";

/// Compute states that still count as part of the rack.
const LIVE_STATES: [&str; 4] = ["pending", "running", "shutting-down", "stopping"];

fn fraction_used(total: i64, remaining: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    (total - remaining) as f64 / total as f64
}

#[async_trait]
impl InstanceOps for Provider {
    async fn instance_list(&self) -> ProviderResult<Vec<Instance>> {
        let mut instances: BTreeMap<String, Instance> = self
            .call(self.substrate().compute.describe_rack_instances(&self.config().rack))
            .await?
            .into_iter()
            .filter(|i| LIVE_STATES.contains(&i.state.as_str()))
            .map(|i| {
                let instance = Instance {
                    id: i.id.clone(),
                    agent: false,
                    status: i.state,
                    private_ip: i.private_ip,
                    public_ip: i.public_ip,
                    processes: 0,
                    cpu: 0.0,
                    memory: 0.0,
                    started: i.launch_time,
                };
                (i.id, instance)
            })
            .collect();

        for ci in self.container_instances(&self.config().cluster).await? {
            let instance = instances.entry(ci.ec2_instance_id.clone()).or_insert_with(|| Instance {
                id: ci.ec2_instance_id.clone(),
                agent: false,
                status: String::new(),
                private_ip: String::new(),
                public_ip: String::new(),
                processes: 0,
                cpu: 0.0,
                memory: 0.0,
                started: ci.registered_at,
            });
            instance.agent = ci.agent_connected;
            instance.status = ci.status.to_lowercase();
            instance.processes = u32::try_from(ci.running_tasks).unwrap_or_default();
            instance.cpu = fraction_used(ci.registered_cpu, ci.remaining_cpu);
            instance.memory = fraction_used(ci.registered_memory, ci.remaining_memory);
        }

        Ok(instances.into_values().collect())
    }

    /// The scaling group replaces the instance; desired capacity is kept.
    async fn instance_terminate(&self, id: &str) -> ProviderResult<()> {
        if !self.instance_list().await?.iter().any(|i| i.id == id) {
            return Err(ProviderError::not_found(format!("no such instance: {id}")));
        }
        self.call(self.substrate().scaling.terminate_instance(id, false))
            .await?;
        info!(instance = %id, "instance terminated");
        Ok(())
    }

    async fn instance_keyroll(&self) -> ProviderResult<()> {
        let rack = &self.config().rack;
        let name = format!("{rack}-keypair-{}", rand::thread_rng().gen_range(1000..=9999));

        let material = self.call(self.substrate().compute.create_key_pair(&name)).await?;
        self.setting_put(INSTANCE_KEY_SETTING, material.as_bytes()).await?;

        let changes = BTreeMap::from([("Key".to_string(), name.clone())]);
        self.update_stack(rack, None, &changes).await?;
        info!(key = %name, "instance key rolled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{INSTANCES_GROUP, TestRack};
    use chrono::Utc;
    use rackplane_substrate::{ComputeInstance, ContainerInstance};

    fn compute(id: &str, state: &str) -> ComputeInstance {
        ComputeInstance {
            id: id.to_string(),
            instance_type: "t2.small".to_string(),
            private_ip: format!("10.0.1.{}", id.len()),
            public_ip: String::new(),
            state: state.to_string(),
            launch_time: Some(Utc::now()),
            spot: false,
        }
    }

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
                remaining_cpu: 256,
                remaining_memory: 1500,
                running_tasks: 3,
                registered_at: Some(Utc::now()),
            },
        );
    }

    #[tokio::test]
    async fn list_merges_compute_and_agent_state() {
        let rack = TestRack::new();
        rack.cloud.compute.insert(compute("i-1", "running"));
        rack.cloud.compute.insert(compute("i-2", "pending"));
        rack.cloud.compute.insert(compute("i-9", "terminated"));
        agent(&rack, "i-1", true);

        let instances = rack.provider.instance_list().await.unwrap();
        let ids: Vec<_> = instances.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["i-1", "i-2"]);

        let first = &instances[0];
        assert!(first.agent);
        assert_eq!(first.status, "active");
        assert_eq!(first.processes, 3);
        assert_eq!(first.cpu, 0.75);
        assert_eq!(first.memory, 0.25);
        assert_eq!(instances[1].status, "pending");
    }

    #[tokio::test]
    async fn terminate_keeps_desired_capacity() {
        let rack = TestRack::new();
        rack.seed_rack();
        rack.cloud.compute.insert(compute("i-1", "running"));

        rack.provider.instance_terminate("i-1").await.unwrap();
        assert_eq!(rack.cloud.scaling.terminated(), [("i-1".to_string(), false)]);
        assert_eq!(rack.cloud.scaling.group(INSTANCES_GROUP).unwrap().desired_capacity, 3);

        let err = rack.provider.instance_terminate("i-404").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(rack.cloud.scaling.terminated().len(), 1);
    }

    #[tokio::test]
    async fn keyroll_stores_the_key_and_updates_the_rack() {
        let rack = TestRack::new();
        rack.seed_rack();
        let p = &rack.provider;

        p.instance_keyroll().await.unwrap();

        let name = rack.cloud.compute.key_pairs().pop().unwrap();
        let suffix: u32 = name.strip_prefix("convox-keypair-").unwrap().parse().unwrap();
        assert!((1000..=9999).contains(&suffix));

        let key = p.setting_get(INSTANCE_KEY_SETTING).await.unwrap();
        assert!(String::from_utf8(key).unwrap().contains("PRIVATE KEY"));
        assert_eq!(rack.cloud.stacks.get("convox").unwrap().parameters["Key"], name);
    }
}
