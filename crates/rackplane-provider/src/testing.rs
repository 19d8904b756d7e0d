//! In-memory rack fixtures for tests in this crate and the ones above it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rack_core::{Config, ServiceIndex};
use rackplane_state::RedbStore;
use rackplane_substrate::memory::MemoryCloud;
use rackplane_substrate::{GroupInstance, ScalingGroup, Stack, StackResource};

use crate::provider::Provider;
use crate::render::{AppTemplate, JsonRenderer, TemplateRenderer};

pub const ACCOUNT: &str = "000000000000";
pub const INSTANCES_GROUP: &str = "convox-Instances-ASG";
pub const SPOT_GROUP: &str = "convox-SpotInstances-ASG";

pub fn test_stack(name: &str, status: &str) -> Stack {
    Stack {
        name: name.to_string(),
        id: String::new(),
        status: status.to_string(),
        status_reason: String::new(),
        parameters: BTreeMap::new(),
        outputs: BTreeMap::new(),
        tags: BTreeMap::new(),
        created: Utc::now(),
    }
}

fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// An in-memory rack named `convox`.
pub struct TestRack {
    pub provider: Provider,
    pub cloud: MemoryCloud,
    pub store: RedbStore,
}

impl TestRack {
    pub fn new() -> Self {
        Self::with_config(Config::local("convox"))
    }

    pub fn with_config(config: Config) -> Self {
        let store = RedbStore::open_in_memory().unwrap();
        let cloud = MemoryCloud::new(&config.region, Arc::new(store.clone()));
        let substrate = cloud.substrate(Arc::new(store.clone()), Arc::new(store.clone()));
        let renderer = Arc::new(JsonRenderer::new(&config.region, ACCOUNT));
        let provider = Provider::new(Arc::new(config), substrate, renderer);
        Self { provider, cloud, store }
    }

    /// Seed a running app stack with a single `web` service.
    pub fn seed_app(&self, name: &str, generation: &str) {
        self.seed_app_with(name, generation, "services:\n  web:\n    build: .\n");
    }

    pub fn seed_app_with(&self, name: &str, generation: &str, manifest: &str) {
        let config = self.provider.config();
        let services = ServiceIndex::parse(manifest);
        let template = JsonRenderer::new(&config.region, ACCOUNT)
            .app(&AppTemplate {
                app: name,
                generation,
                release: None,
                services: &services,
                version: &config.version,
            })
            .unwrap();

        let mut stack = test_stack(&config.app_stack(name), "CREATE_COMPLETE");
        stack.tags = map(&[
            ("Generation", generation),
            ("Name", name),
            ("Rack", &config.rack),
            ("System", "convox"),
            ("Type", "app"),
            ("Version", &config.version),
        ]);
        stack.parameters = map(&[
            ("LogBucket", &config.log_bucket),
            ("Private", "No"),
            ("Rack", &config.rack),
            ("Subnets", &config.subnets),
            ("SubnetsPrivate", &config.subnets),
            ("Version", &config.version),
        ]);
        if generation != "2" {
            for (key, value) in [
                ("Cluster", config.cluster.as_str()),
                ("Key", ""),
                ("Release", ""),
                ("VPC", config.vpc.as_str()),
                ("VPCCIDR", config.vpc_cidr.as_str()),
            ] {
                stack.parameters.insert(key.to_string(), value.to_string());
            }
        }
        for service in services.names() {
            stack
                .parameters
                .insert(format!("{}Count", crate::render::upper_name(service)), "1".to_string());
        }
        self.cloud.stacks.insert(stack, &template);
    }

    /// Seed the rack's own stack with two scaling groups of three instances.
    pub fn seed_rack(&self) {
        let template = r#"{
          "Parameters": {
            "Autoscale": {"Type": "String"}, "InstanceCount": {"Type": "String"},
            "InstanceType": {"Type": "String"}, "Key": {"Type": "String"},
            "Password": {"Type": "String"}, "Subnets": {"Type": "String"},
            "Version": {"Type": "String"}, "VPC": {"Type": "String"}
          },
          "Resources": {
            "AccountEvents": {"Type": "AWS::SQS::Queue"},
            "CloudformationEvents": {"Type": "AWS::SQS::Queue"},
            "EncryptionKey": {"Type": "AWS::KMS::Key"},
            "LogGroup": {"Type": "AWS::Logs::LogGroup"}
          },
          "Outputs": {"Domain": {"Value": "convox.example.org"}}
        }"#;

        let config = self.provider.config();
        let mut stack = test_stack(&config.rack, "UPDATE_COMPLETE");
        stack.id = format!("arn:aws:cloudformation:us-east-1:{ACCOUNT}:stack/convox/1");
        stack.tags = map(&[("System", "convox"), ("Type", "rack")]);
        stack.parameters = map(&[
            ("Autoscale", "No"),
            ("InstanceCount", "3"),
            ("InstanceType", "t2.small"),
            ("Key", ""),
            ("Password", "secret"),
            ("Subnets", "subnet-a,subnet-b"),
            ("Version", "dev"),
            ("VPC", "vpc-1"),
        ]);
        self.cloud.stacks.insert(stack, template);

        for (logical, physical, kind) in [
            ("Instances", INSTANCES_GROUP, "AWS::AutoScaling::AutoScalingGroup"),
            ("SpotInstances", SPOT_GROUP, "AWS::AutoScaling::AutoScalingGroup"),
            ("AccountEvents", "convox-AccountEvents", "AWS::SQS::Queue"),
            ("CloudformationEvents", "convox-CloudformationEvents", "AWS::SQS::Queue"),
            ("LogGroup", "convox-LogGroup", "AWS::Logs::LogGroup"),
        ] {
            self.cloud.stacks.add_resource(
                &config.rack,
                StackResource {
                    logical_id: logical.to_string(),
                    physical_id: physical.to_string(),
                    resource_type: kind.to_string(),
                    status: "CREATE_COMPLETE".to_string(),
                },
            );
        }

        let in_service = |id: &str| GroupInstance {
            id: id.to_string(),
            lifecycle_state: "InService".to_string(),
            health_status: "Healthy".to_string(),
        };
        self.cloud.scaling.insert(ScalingGroup {
            name: INSTANCES_GROUP.to_string(),
            desired_capacity: 3,
            min_size: 0,
            max_size: 20,
            instances: vec![in_service("i-1"), in_service("i-2"), in_service("i-3")],
        });
        self.cloud.scaling.insert(ScalingGroup {
            name: SPOT_GROUP.to_string(),
            desired_capacity: 0,
            min_size: 0,
            max_size: 20,
            instances: Vec::new(),
        });
    }
}
