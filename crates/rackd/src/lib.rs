//! rackd: assembles a rack control plane from configuration.
//!
//! ```text
//!   Config ──▶ assemble ──▶ RedbStore ──┬──▶ Tables + ObjectStore
//!                                       └──▶ MemoryCloud ──▶ Substrate
//!                                                               │
//!                              JsonRenderer ──▶ Provider ◀──────┘
//! ```
//!
//! The `local` binding keeps tables and objects in a redb file under the
//! data directory; the `test` binding keeps everything in memory. The
//! `aws` binding is recognized but not part of this build.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use rack_core::{Config, ConfigError, ProviderKind};
use rackplane_provider::{JsonRenderer, Provider};
use rackplane_state::RedbStore;
use rackplane_substrate::memory::MemoryCloud;
use rackplane_substrate::{ScalingGroup, Stack, StackResource};
use tracing::info;

/// Account id reported by the in-process bindings.
pub const LOCAL_ACCOUNT: &str = "000000000000";

pub const DEFAULT_DATA_DIR: &str = "/var/lib/rackd";

const STATE_FILE: &str = "rack.redb";

/// An assembled rack: the provider plus the in-process services behind it.
#[derive(Clone)]
pub struct Rack {
    pub provider: Provider,
    pub cloud: MemoryCloud,
    pub store: RedbStore,
}

/// Open the state store for `config`'s binding.
fn open_store(config: &Config) -> anyhow::Result<RedbStore> {
    match config.provider {
        ProviderKind::Aws => Err(ConfigError::Unsupported(
            "aws (set PROVIDER=local to run against the in-process services)".to_string(),
        )
        .into()),
        ProviderKind::Local => {
            let dir = config
                .data_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
            std::fs::create_dir_all(&dir)?;
            let path = dir.join(STATE_FILE);
            let store = RedbStore::open(&path)?;
            info!(path = ?path, "state store opened");
            Ok(store)
        }
        ProviderKind::Test => {
            info!("in-memory state store opened");
            Ok(RedbStore::open_in_memory()?)
        }
    }
}

/// Build the provider for `config`.
pub fn assemble(config: Config) -> anyhow::Result<Rack> {
    let store = open_store(&config)?;
    let cloud = MemoryCloud::new(&config.region, Arc::new(store.clone()));
    let substrate = cloud.substrate(Arc::new(store.clone()), Arc::new(store.clone()));
    let renderer = Arc::new(JsonRenderer::new(&config.region, LOCAL_ACCOUNT));
    info!(rack = %config.rack, provider = %config.provider, region = %config.region, "provider assembled");

    let provider = Provider::new(Arc::new(config), substrate, renderer);
    Ok(Rack { provider, cloud, store })
}

// ── Local bootstrap ────────────────────────────────────────────

const RACK_TEMPLATE: &str = r#"{
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
  "Outputs": {}
}"#;

const INITIAL_INSTANCES: i64 = 3;

fn rack_parameters(config: &Config) -> BTreeMap<String, String> {
    [
        ("Autoscale", if config.autoscale { "Yes" } else { "No" }),
        ("InstanceType", "t2.small"),
        ("Key", ""),
        ("Password", ""),
        ("Subnets", config.subnets.as_str()),
        ("Version", config.version.as_str()),
        ("VPC", config.vpc.as_str()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .chain([("InstanceCount".to_string(), INITIAL_INSTANCES.to_string())])
    .collect()
}

impl Rack {
    /// Create the rack's own stack and scaling groups if they do not exist
    /// yet. Returns whether anything was created.
    pub fn bootstrap(&self) -> bool {
        let config = self.provider.config();
        if self.cloud.stacks.get(&config.rack).is_some() {
            return false;
        }

        let stack = Stack {
            name: config.rack.clone(),
            id: String::new(),
            status: "CREATE_COMPLETE".to_string(),
            status_reason: String::new(),
            parameters: rack_parameters(config),
            outputs: BTreeMap::new(),
            tags: BTreeMap::from([
                ("System".to_string(), "convox".to_string()),
                ("Type".to_string(), "rack".to_string()),
            ]),
            created: Utc::now(),
        };
        self.cloud.stacks.insert(stack, RACK_TEMPLATE);

        for (logical, desired) in [("Instances", INITIAL_INSTANCES), ("SpotInstances", 0)] {
            let name = format!("{}-{logical}-ASG", config.rack);
            self.cloud.stacks.add_resource(
                &config.rack,
                StackResource {
                    logical_id: logical.to_string(),
                    physical_id: name.clone(),
                    resource_type: "AWS::AutoScaling::AutoScalingGroup".to_string(),
                    status: "CREATE_COMPLETE".to_string(),
                },
            );
            self.cloud.scaling.insert(ScalingGroup {
                name,
                desired_capacity: desired,
                min_size: 0,
                max_size: 20,
                instances: Vec::new(),
            });
        }
        info!(rack = %config.rack, "rack stack bootstrapped");
        true
    }
}

/// Apply a `--data-dir` override and load the rest from the environment.
pub fn load_config(data_dir: Option<&Path>) -> anyhow::Result<Config> {
    let mut config = Config::from_env()?;
    if let Some(dir) = data_dir {
        config.data_dir = Some(dir.to_path_buf());
    }
    Ok(config)
}
