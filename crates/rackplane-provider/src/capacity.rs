//! Cluster capacity: what the instances offer against what services reserve.

use std::collections::BTreeMap;

use rack_core::Capacity;
use rackplane_substrate::{Service, TaskDefinition};

use crate::error::ProviderResult;
use crate::provider::Provider;

const DESCRIBE_SERVICES_PAGE: usize = 10;

/// `(container, container port)` → host port, for balanced gen1 containers.
fn host_ports(def: &TaskDefinition) -> BTreeMap<(&str, u16), u16> {
    def.containers
        .iter()
        .filter(|c| c.labels.get("convox.generation").map(String::as_str) != Some("2"))
        .flat_map(|c| {
            c.port_mappings
                .iter()
                .map(move |pm| ((c.name.as_str(), pm.container_port), pm.host_port))
        })
        .collect()
}

impl Provider {
    pub(crate) async fn capacity(&self) -> ProviderResult<Capacity> {
        let cluster = &self.config().cluster;
        let mut capacity = Capacity::default();

        for ci in self.container_instances(cluster).await? {
            if ci.status == "DRAINING" {
                continue;
            }
            capacity.instance_cpu = ci.registered_cpu;
            capacity.instance_memory = ci.registered_memory;
            capacity.cluster_cpu += ci.registered_cpu;
            capacity.cluster_memory += ci.registered_memory;
        }

        // Host ports are exclusive per instance, so the busiest one bounds
        // how narrow the cluster may get.
        let mut port_width: BTreeMap<u16, i64> = BTreeMap::new();

        for service in self.cluster_services(cluster).await? {
            if !service.load_balancers.is_empty() {
                for deployment in &service.deployments {
                    let def = self.task_definition(&deployment.task_definition).await?;
                    let ports = host_ports(&def);
                    for lb in &service.load_balancers {
                        if let Some(port) = ports.get(&(lb.container_name.as_str(), lb.container_port)) {
                            *port_width.entry(*port).or_default() += deployment.desired_count;
                        }
                    }
                }
            }

            let def = self.task_definition(&service.task_definition).await?;
            for container in &def.containers {
                capacity.process_count += service.desired_count;
                capacity.process_memory += service.desired_count * container.memory.unwrap_or_default();
                capacity.process_cpu += service.desired_count * container.cpu.unwrap_or_default();
            }
        }

        capacity.process_width = port_width.into_values().max().unwrap_or_default();
        Ok(capacity)
    }

    pub async fn cluster_services(&self, cluster: &str) -> ProviderResult<Vec<Service>> {
        let scheduler = &self.substrate().scheduler;
        let arns = self.call(scheduler.list_services(cluster)).await?;
        let mut services = Vec::with_capacity(arns.len());
        for page in arns.chunks(DESCRIBE_SERVICES_PAGE) {
            services.extend(self.call(scheduler.describe_services(cluster, page)).await?);
        }
        Ok(services)
    }
}
