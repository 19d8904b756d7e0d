//! The rack itself: its stack, its release history, its processes and
//! metrics.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rack_core::{
    Capacity, Event, LogsOptions, Metric, MetricValue, MetricsOptions, Process, Release, System, SystemUpdateOptions,
};
use rackplane_stream::PipeReader;
use rackplane_substrate::{ListTasksFilter, MetricQuery};
use tracing::info;

use crate::error::{ProviderError, ProviderResult};
use crate::ops::SystemOps;
use crate::provider::Provider;
use crate::releases::{release_from_item, release_to_item};
use crate::stack::human_status;

/// Instance types a rack may be moved to.
pub const INSTANCE_TYPES: &[&str] = &[
    "c4.large", "c4.xlarge", "c4.2xlarge", "c4.4xlarge", "c4.8xlarge",
    "c5.large", "c5.xlarge", "c5.2xlarge", "c5.4xlarge", "c5.9xlarge", "c5.18xlarge",
    "m3.medium", "m3.large", "m3.xlarge", "m3.2xlarge",
    "m4.large", "m4.xlarge", "m4.2xlarge", "m4.4xlarge", "m4.10xlarge", "m4.16xlarge",
    "m5.large", "m5.xlarge", "m5.2xlarge", "m5.4xlarge", "m5.12xlarge", "m5.24xlarge",
    "r3.large", "r3.xlarge", "r3.2xlarge", "r3.4xlarge", "r3.8xlarge",
    "r4.large", "r4.xlarge", "r4.2xlarge", "r4.4xlarge", "r4.8xlarge", "r4.16xlarge",
    "t2.nano", "t2.micro", "t2.small", "t2.medium", "t2.large", "t2.xlarge", "t2.2xlarge",
    "t3.nano", "t3.micro", "t3.small", "t3.medium", "t3.large", "t3.xlarge", "t3.2xlarge",
];

const SYSTEM_RELEASE_LIMIT: usize = 20;
const METRIC_PERIOD_SECS: u64 = 3600;
const METRIC_PRECISION: f64 = 100_000.0;

struct MetricDefinition {
    name: &'static str,
    namespace: &'static str,
    metric: &'static str,
    dimension: &'static str,
}

const SYSTEM_METRICS: [MetricDefinition; 3] = [
    MetricDefinition {
        name: "cluster:cpu:utilization",
        namespace: "AWS/ECS",
        metric: "CPUUtilization",
        dimension: "ClusterName",
    },
    MetricDefinition {
        name: "cluster:mem:utilization",
        namespace: "AWS/ECS",
        metric: "MemoryUtilization",
        dimension: "ClusterName",
    },
    MetricDefinition {
        name: "instances:standard:cpu",
        namespace: "AWS/EC2",
        metric: "CPUUtilization",
        dimension: "AutoScalingGroupName",
    },
];

fn floor_precision(v: f64) -> f64 {
    (v * METRIC_PRECISION).floor() / METRIC_PRECISION
}

fn validate_update(opts: &SystemUpdateOptions) -> ProviderResult<()> {
    if opts.count == Some(0) {
        return Err(ProviderError::validation("instance count must be at least 1"));
    }
    if let Some(kind) = &opts.instance_type {
        if !INSTANCE_TYPES.contains(&kind.as_str()) {
            return Err(ProviderError::validation(format!("invalid instance type: {kind}")));
        }
    }
    Ok(())
}

#[async_trait]
impl SystemOps for Provider {
    async fn system_get(&self) -> ProviderResult<System> {
        let rack = &self.config().rack;
        let stack = self.describe_stack(rack).await?;
        let mut status = human_status(&stack.status).to_string();

        if status == "running" && self.rack_converging().await? {
            status = "converging".to_string();
        }

        let count = stack
            .parameters
            .get("InstanceCount")
            .and_then(|c| c.parse().ok())
            .unwrap_or_default();
        let version = if self.config().development {
            "dev".to_string()
        } else {
            stack.parameters.get("Version").cloned().unwrap_or_default()
        };

        Ok(System {
            name: rack.clone(),
            count,
            domain: stack.outputs.get("Domain").cloned().unwrap_or_default(),
            provider: self.config().provider.to_string(),
            region: self.config().region.clone(),
            status,
            instance_type: stack.parameters.get("InstanceType").cloned().unwrap_or_default(),
            version,
            outputs: stack.outputs,
            parameters: stack.parameters,
        })
    }

    async fn system_update(&self, opts: SystemUpdateOptions) -> ProviderResult<()> {
        let mut event = Event::new("rack:update");
        if let Some(count) = opts.count {
            event = event.with("count", count.to_string());
        }
        if let Some(kind) = &opts.instance_type {
            event = event.with("type", kind.as_str());
        }
        if let Some(version) = &opts.version {
            event = event.with("version", version.as_str());
        }

        match self.apply_update(&opts).await {
            Ok(false) => Ok(()),
            Ok(true) => {
                self.notify(event, None).await;
                Ok(())
            }
            Err(e) => {
                self.notify(event, Some(&e)).await;
                Err(e)
            }
        }
    }

    async fn system_releases(&self) -> ProviderResult<Vec<Release>> {
        let rows = self
            .call(self.substrate().tables.query_app(
                &self.config().dynamo_releases,
                &self.config().rack,
                Some(SYSTEM_RELEASE_LIMIT),
                true,
            ))
            .await?;
        Ok(rows.iter().map(release_from_item).collect())
    }

    /// Rack services only, or every task on the cluster with `all`.
    async fn system_processes(&self, all: bool) -> ProviderResult<Vec<Process>> {
        let rack = &self.config().rack;
        let arns: BTreeSet<String> = if all {
            self.call(
                self.substrate()
                    .scheduler
                    .list_tasks(&self.config().cluster, ListTasksFilter::default()),
            )
            .await?
            .into_iter()
            .collect()
        } else {
            self.stack_task_arns(rack).await?
        };

        let arns: Vec<String> = arns.into_iter().collect();
        let mut processes = self.task_processes(&arns).await?;
        for p in &mut processes {
            if p.app.is_empty() {
                p.app = rack.clone();
            }
        }
        Ok(processes)
    }

    async fn system_logs(&self, opts: LogsOptions) -> ProviderResult<PipeReader> {
        let group = self.stack_resource(&self.config().rack, "LogGroup").await?;
        Ok(self.subscribe_logs(group, opts))
    }

    async fn system_metrics(&self, opts: MetricsOptions) -> ProviderResult<Vec<Metric>> {
        let end = opts.end.unwrap_or_else(Utc::now);
        let start = opts.start.unwrap_or_else(|| end - ChronoDuration::hours(24));
        let period_secs = opts.period_secs.unwrap_or(METRIC_PERIOD_SECS);

        let mut metrics = Vec::new();
        for def in &SYSTEM_METRICS {
            if !opts.names.is_empty() && !opts.names.iter().any(|n| n == def.name) {
                continue;
            }
            let value = match def.dimension {
                "ClusterName" => self.config().cluster.clone(),
                _ => self.stack_resource(&self.config().rack, "Instances").await?,
            };
            let query = MetricQuery {
                namespace: def.namespace.to_string(),
                name: def.metric.to_string(),
                dimensions: vec![(def.dimension.to_string(), value)],
                start,
                end,
                period_secs,
            };
            let mut values: Vec<MetricValue> = self
                .call(self.substrate().metrics.get_statistics(query))
                .await?
                .into_iter()
                .map(|p| MetricValue {
                    time: p.timestamp,
                    average: floor_precision(p.average),
                    minimum: floor_precision(p.minimum),
                    maximum: floor_precision(p.maximum),
                })
                .collect();
            values.sort_by_key(|v| v.time);
            metrics.push(Metric {
                name: def.name.to_string(),
                values,
            });
        }
        Ok(metrics)
    }

    async fn capacity_get(&self) -> ProviderResult<Capacity> {
        self.capacity().await
    }
}

impl Provider {
    /// Apply the requested rack changes. Returns whether there were any.
    async fn apply_update(&self, opts: &SystemUpdateOptions) -> ProviderResult<bool> {
        validate_update(opts)?;

        let rack = &self.config().rack;
        let mut changes = BTreeMap::new();
        if let Some(count) = opts.count {
            changes.insert("InstanceCount".to_string(), count.to_string());
        }
        if let Some(kind) = &opts.instance_type {
            changes.insert("InstanceType".to_string(), kind.clone());
        }
        if let Some(version) = &opts.version {
            changes.insert("Version".to_string(), version.clone());

            let release = Release {
                id: version.clone(),
                ..Release::new(rack)
            };
            self.call(
                self.substrate()
                    .tables
                    .put_item(&self.config().dynamo_releases, release_to_item(&release)),
            )
            .await?;
        }

        if changes.is_empty() {
            return Ok(false);
        }

        self.update_stack(rack, None, &changes).await?;
        info!(%rack, ?changes, "rack update requested");
        Ok(true)
    }

    /// True while the instance scaling group has members outside `InService`.
    async fn rack_converging(&self) -> ProviderResult<bool> {
        let group = self.stack_resource(&self.config().rack, "Instances").await?;
        let groups = self
            .call(self.substrate().scaling.describe_groups(std::slice::from_ref(&group)))
            .await?;
        let group = groups
            .first()
            .ok_or_else(|| ProviderError::internal(format!("scaling group {group} was not found")))?;
        Ok(group.instances.iter().any(|i| i.lifecycle_state != "InService"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{INSTANCES_GROUP, TestRack};
    use rackplane_substrate::{Datapoint, TemplateSource};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn get_reports_parameters_and_outputs() {
        let rack = TestRack::new();
        rack.seed_rack();

        let system = rack.provider.system_get().await.unwrap();
        assert_eq!(system.name, "convox");
        assert_eq!(system.count, 3);
        assert_eq!(system.instance_type, "t2.small");
        assert_eq!(system.version, "dev");
        assert_eq!(system.domain, "convox.example.org");
        assert_eq!(system.status, "running");
        assert_eq!(system.provider, "test");
    }

    #[tokio::test]
    async fn get_reports_converging_while_instances_cycle() {
        let rack = TestRack::new();
        rack.seed_rack();
        let mut group = rack.cloud.scaling.group(INSTANCES_GROUP).unwrap();
        group.instances[1].lifecycle_state = "Pending".to_string();
        rack.cloud.scaling.insert(group);

        assert_eq!(rack.provider.system_get().await.unwrap().status, "converging");
    }

    #[tokio::test]
    async fn missing_rack_is_not_found() {
        let rack = TestRack::new();
        assert!(rack.provider.system_get().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn update_records_a_release_and_changes_only_named_parameters() {
        let rack = TestRack::new();
        rack.seed_rack();
        let p = &rack.provider;

        p.system_update(SystemUpdateOptions {
            count: Some(5),
            instance_type: Some("t2.small".to_string()),
            version: Some("20171214220445".to_string()),
        })
        .await
        .unwrap();

        let update = rack.cloud.stacks.updates().pop().unwrap();
        assert_eq!(update.template, TemplateSource::Previous);
        let keys: Vec<_> = update.parameters.iter().map(|pv| pv.key.as_str()).collect();
        assert_eq!(
            keys,
            ["Autoscale", "InstanceCount", "InstanceType", "Key", "Password", "Subnets", "VPC", "Version"]
        );
        let set: BTreeMap<_, _> = update
            .parameters
            .iter()
            .filter_map(|pv| pv.value.as_deref().map(|v| (pv.key.as_str(), v)))
            .collect();
        assert_eq!(
            set,
            BTreeMap::from([
                ("InstanceCount", "5"),
                ("InstanceType", "t2.small"),
                ("Version", "20171214220445"),
            ])
        );

        let releases = p.system_releases().await.unwrap();
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].id, "20171214220445");
        assert_eq!(releases[0].app, "convox");
    }

    #[tokio::test]
    async fn invalid_instance_type_never_reaches_the_substrate() {
        let rack = TestRack::new();
        rack.seed_rack();
        let before = rack.cloud.stacks.describe_calls();

        let err = rack
            .provider
            .system_update(SystemUpdateOptions {
                instance_type: Some("t2.enormous".to_string()),
                version: Some("20171214220445".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Validation(_)));
        assert_eq!(rack.cloud.stacks.describe_calls(), before);
        assert!(rack.cloud.stacks.updates().is_empty());
        assert!(rack.provider.system_releases().await.unwrap().is_empty());

        let published = rack.cloud.bus.published();
        let last = published.last().unwrap();
        assert_eq!(last.subject, "rack:update");
        let body: serde_json::Value = serde_json::from_str(&last.message).unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["data"]["type"], "t2.enormous");
    }

    #[tokio::test]
    async fn logs_come_from_the_rack_log_group() {
        let rack = TestRack::new();
        rack.seed_rack();
        let group = rack.provider.stack_resource("convox", "LogGroup").await.unwrap();
        let now = Utc::now().timestamp_millis();
        rack.cloud.logs.push(&group, "system", now, "rack started");

        let mut out = String::new();
        rack.provider
            .system_logs(LogsOptions::default())
            .await
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert!(out.ends_with(" rack started\n"), "{out}");
    }

    #[tokio::test]
    async fn metrics_are_floored_and_filtered_by_name() {
        let rack = TestRack::new();
        rack.seed_rack();
        let now = Utc::now();
        rack.cloud.metrics.insert(
            "CPUUtilization",
            vec![Datapoint {
                timestamp: now - ChronoDuration::hours(1),
                average: 12.3456789,
                minimum: 1.0,
                maximum: 50.0,
            }],
        );

        let metrics = rack
            .provider
            .system_metrics(MetricsOptions {
                names: vec!["cluster:cpu:utilization".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].name, "cluster:cpu:utilization");
        assert_eq!(metrics[0].values[0].average, 12.34567);

        let query = rack.cloud.metrics.queries().pop().unwrap();
        assert_eq!(query.namespace, "AWS/ECS");
        assert_eq!(query.dimensions, [("ClusterName".to_string(), "convox-cluster".to_string())]);
        assert_eq!(query.period_secs, 3600);
    }
}
