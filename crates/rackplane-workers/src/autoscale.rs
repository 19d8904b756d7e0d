//! Rack autoscaler: instance count follows reserved capacity.
//!
//! Desired instances are the most of: two, enough for all reserved cpu
//! plus one spare, enough for all reserved memory plus one spare, and the
//! widest port binding plus one. Growth happens in one step; shrinking
//! drops one instance per tick and only while the rack is fully settled.

use std::time::Duration;

use async_trait::async_trait;
use rack_core::{Capacity, SystemUpdateOptions};
use rackplane_provider::{Provider, SystemOps};
use tracing::{debug, info};

use crate::runner::Worker;

pub const AUTOSCALE_INTERVAL: Duration = Duration::from_secs(60);

const MIN_INSTANCES: i64 = 2;

/// A scaling decision for the rack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Scale to the specified instance count.
    ScaleTo(u32),
    /// No change needed.
    NoChange,
}

fn instances_for(reserved: i64, per_instance: i64) -> i64 {
    if per_instance <= 0 {
        return 0;
    }
    (reserved + per_instance - 1) / per_instance + 1
}

pub fn desired_instances(capacity: &Capacity) -> u32 {
    let desired = MIN_INSTANCES
        .max(instances_for(capacity.process_cpu, capacity.instance_cpu))
        .max(instances_for(capacity.process_memory, capacity.instance_memory))
        .max(capacity.process_width + 1);
    u32::try_from(desired).unwrap_or(u32::MAX)
}

/// Decide the next instance count for a rack at `status` running `current`.
pub fn evaluate(status: &str, current: u32, capacity: &Capacity) -> ScaleDecision {
    if !matches!(status, "running" | "converging") {
        return ScaleDecision::NoChange;
    }
    let desired = desired_instances(capacity);
    if desired > current {
        ScaleDecision::ScaleTo(desired)
    } else if desired < current && status == "running" {
        ScaleDecision::ScaleTo(current - 1)
    } else {
        ScaleDecision::NoChange
    }
}

pub struct Autoscaler {
    provider: Provider,
}

impl Autoscaler {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider: provider.without_cache(),
        }
    }
}

#[async_trait]
impl Worker for Autoscaler {
    fn name(&self) -> &'static str {
        "autoscale"
    }

    fn interval(&self) -> Duration {
        AUTOSCALE_INTERVAL
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let system = self.provider.system_get().await?;
        let capacity = self.provider.capacity_get().await?;

        match evaluate(&system.status, system.count, &capacity) {
            ScaleDecision::ScaleTo(count) => {
                info!(status = %system.status, from = system.count, to = count, "autoscaling rack");
                self.provider
                    .system_update(SystemUpdateOptions {
                        count: Some(count),
                        ..Default::default()
                    })
                    .await?;
            }
            ScaleDecision::NoChange => {
                debug!(status = %system.status, count = system.count, ?capacity, "no scaling needed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rackplane_provider::testing::{INSTANCES_GROUP, TestRack};
    use rackplane_substrate::{ContainerDefinition, ContainerInstance, Service, TaskDefinition};

    fn capacity(process_cpu: i64, process_memory: i64, process_width: i64) -> Capacity {
        Capacity {
            cluster_cpu: 3072,
            cluster_memory: 6000,
            instance_cpu: 1024,
            instance_memory: 2000,
            process_count: 1,
            process_cpu,
            process_memory,
            process_width,
        }
    }

    #[test]
    fn desired_takes_the_largest_constraint() {
        assert_eq!(desired_instances(&capacity(0, 0, 0)), 2);
        assert_eq!(desired_instances(&capacity(2500, 0, 0)), 4);
        assert_eq!(desired_instances(&capacity(0, 4001, 0)), 4);
        assert_eq!(desired_instances(&capacity(0, 0, 5)), 6);
        assert_eq!(desired_instances(&Capacity::default()), 2);
    }

    #[test]
    fn scale_up_is_immediate() {
        assert_eq!(evaluate("running", 3, &capacity(0, 0, 5)), ScaleDecision::ScaleTo(6));
        assert_eq!(evaluate("converging", 3, &capacity(0, 0, 5)), ScaleDecision::ScaleTo(6));
    }

    #[test]
    fn scale_down_is_one_step_and_only_when_running() {
        assert_eq!(evaluate("running", 5, &capacity(0, 0, 0)), ScaleDecision::ScaleTo(4));
        assert_eq!(evaluate("converging", 5, &capacity(0, 0, 0)), ScaleDecision::NoChange);
        assert_eq!(evaluate("running", 2, &capacity(0, 0, 0)), ScaleDecision::NoChange);
    }

    #[test]
    fn unsettled_racks_are_left_alone() {
        for status in ["updating", "rollback", "failed"] {
            assert_eq!(evaluate(status, 1, &capacity(9000, 0, 0)), ScaleDecision::NoChange);
        }
    }

    #[tokio::test]
    async fn tick_updates_the_instance_count() {
        let rack = TestRack::new();
        rack.seed_rack();
        let scheduler = &rack.cloud.scheduler;
        for id in ["i-1", "i-2", "i-3"] {
            scheduler.add_container_instance(
                "convox-cluster",
                ContainerInstance {
                    arn: format!("arn:aws:ecs:us-east-1:000000000000:container-instance/{id}"),
                    ec2_instance_id: id.to_string(),
                    agent_connected: true,
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
        scheduler.add_task_definition(TaskDefinition {
            arn: "def:worker:1".to_string(),
            family: "convox-httpd-worker".to_string(),
            containers: vec![ContainerDefinition {
                name: "worker".to_string(),
                memory: Some(1000),
                cpu: Some(256),
                ..Default::default()
            }],
        });
        scheduler.add_service(
            "convox-cluster",
            Service {
                arn: "arn:aws:ecs:us-east-1:000000000000:service/worker".to_string(),
                name: "worker".to_string(),
                task_definition: "def:worker:1".to_string(),
                desired_count: 8,
                running_count: 8,
                deployments: Vec::new(),
                load_balancers: Vec::new(),
                events: Vec::new(),
            },
        );

        Autoscaler::new(rack.provider.clone()).tick().await.unwrap();

        // 8000 MB reserved over 2000 MB instances needs 4, plus one spare.
        let stack = rack.cloud.stacks.get("convox").unwrap();
        assert_eq!(stack.parameters["InstanceCount"], "5");
        assert_eq!(rack.cloud.scaling.group(INSTANCES_GROUP).unwrap().desired_capacity, 3);
    }
}
