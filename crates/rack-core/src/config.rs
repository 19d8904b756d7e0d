//! Rack configuration, read once from the process environment.
//!
//! The resulting [`Config`] is immutable and shared as `Arc<Config>` by the
//! provider, the workers, and the daemon.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while reading configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("substrate binding not available: {0}")]
    Unsupported(String),
}

/// Which substrate binding the process talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Aws,
    Local,
    Test,
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aws" => Ok(Self::Aws),
            "local" => Ok(Self::Local),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::Invalid {
                key: "PROVIDER",
                value: other.to_string(),
                reason: "expected one of aws, local, test".to_string(),
            }),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Aws => "aws",
            Self::Local => "local",
            Self::Test => "test",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub rack: String,
    pub provider: ProviderKind,

    pub region: String,
    pub access: Option<String>,
    pub secret: Option<String>,
    pub endpoint: Option<String>,

    pub cluster: String,
    pub build_cluster: String,

    pub dynamo_builds: String,
    pub dynamo_releases: String,

    pub settings_bucket: String,
    pub log_bucket: String,

    pub registry_host: String,
    pub password: Option<String>,

    pub notification_topic: String,
    pub custom_topic: String,
    pub notification_host: String,

    /// KMS key id for envelope encryption. Unset means secrets are stored in plaintext.
    pub encryption_key: Option<String>,

    pub subnets: String,
    pub subnets_private: String,
    pub vpc: String,
    pub vpc_cidr: String,
    pub security_group: String,

    pub development: bool,
    pub autoscale: bool,
    pub internal: bool,

    pub spot_instances: bool,
    pub on_demand_min_count: Option<u32>,

    pub heartbeat_url: Option<String>,

    /// Rack version string.
    pub version: String,

    pub service_events_interval_secs: u64,

    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration from an explicit key/value map.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| map.get(key).cloned())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let string = |key: &str, default: &str| {
            get(key)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let optional = |key: &str| get(key).filter(|v| !v.is_empty());
        let flag = |key: &str| get(key).as_deref() == Some("true");

        let provider = match optional("PROVIDER") {
            Some(p) => p.parse()?,
            None => ProviderKind::Local,
        };

        let on_demand_min_count = match optional("ON_DEMAND_MIN_COUNT") {
            Some(v) => Some(v.parse::<u32>().map_err(|e| ConfigError::Invalid {
                key: "ON_DEMAND_MIN_COUNT",
                value: v.clone(),
                reason: e.to_string(),
            })?),
            None => None,
        };

        let service_events_interval_secs = match optional("LOG_SERVICE_EVENTS_INTERVAL_SECONDS") {
            Some(v) => v.parse::<u64>().unwrap_or(1).max(1),
            None => 1,
        };

        let cluster = string("CLUSTER", "");
        let rack = string("RACK", "convox");

        Ok(Self {
            provider,
            region: string("AWS_REGION", "us-east-1"),
            access: optional("AWS_ACCESS"),
            secret: optional("AWS_SECRET"),
            endpoint: optional("AWS_ENDPOINT"),
            build_cluster: string("BUILD_CLUSTER", &cluster),
            cluster,
            dynamo_builds: string("DYNAMO_BUILDS", &format!("{rack}-builds")),
            dynamo_releases: string("DYNAMO_RELEASES", &format!("{rack}-releases")),
            settings_bucket: string("SETTINGS_BUCKET", &format!("{rack}-settings")),
            log_bucket: string("LOG_BUCKET", ""),
            registry_host: string("REGISTRY_HOST", ""),
            password: optional("PASSWORD"),
            notification_topic: string("NOTIFICATION_TOPIC", ""),
            custom_topic: string("CUSTOM_TOPIC", ""),
            notification_host: string("NOTIFICATION_HOST", ""),
            encryption_key: optional("ENCRYPTION_KEY"),
            subnets: string("SUBNETS", ""),
            subnets_private: string("SUBNETS_PRIVATE", ""),
            vpc: string("VPC", ""),
            vpc_cidr: string("VPCCIDR", ""),
            security_group: string("SECURITY_GROUP", ""),
            development: flag("DEVELOPMENT"),
            autoscale: flag("AUTOSCALE"),
            internal: flag("INTERNAL"),
            spot_instances: flag("SPOT_INSTANCES"),
            on_demand_min_count,
            heartbeat_url: optional("HEARTBEAT_URL"),
            version: string("RELEASE", "dev"),
            service_events_interval_secs,
            data_dir: optional("DATA_DIR").map(PathBuf::from),
            rack,
        })
    }

    /// A configuration suitable for the local binding, with every bucket,
    /// table, and topic named after the rack.
    pub fn local(rack: &str) -> Self {
        let mut map = HashMap::new();
        map.insert("RACK".to_string(), rack.to_string());
        map.insert("PROVIDER".to_string(), "test".to_string());
        map.insert("CLUSTER".to_string(), format!("{rack}-cluster"));
        map.insert("LOG_BUCKET".to_string(), format!("{rack}-logs"));
        map.insert("REGISTRY_HOST".to_string(), format!("registry.{rack}.local"));
        map.insert("NOTIFICATION_TOPIC".to_string(), format!("{rack}-notifications"));
        map.insert("CUSTOM_TOPIC".to_string(), format!("{rack}-custom"));
        map.insert("ENCRYPTION_KEY".to_string(), format!("{rack}-key"));
        map.insert("SUBNETS".to_string(), "subnet-a,subnet-b".to_string());
        map.insert("VPC".to_string(), "vpc-1".to_string());
        map.insert("VPCCIDR".to_string(), "10.0.0.0/16".to_string());
        // Every key above is well-formed, so parsing cannot fail.
        Self::from_map(&map).unwrap_or_else(|_| unreachable!("static local config"))
    }

    /// Name of the stack backing the given app.
    pub fn app_stack(&self, app: &str) -> String {
        format!("{}-{}", self.rack, app)
    }

    pub fn service_events_interval(&self) -> Duration {
        Duration::from_secs(self.service_events_interval_secs)
    }

    /// Copy with credentials blanked, for display.
    pub fn redacted(&self) -> Self {
        let mask = |v: &Option<String>| v.as_ref().map(|_| "********".to_string());
        Self {
            access: mask(&self.access),
            secret: mask(&self.secret),
            password: mask(&self.password),
            ..self.clone()
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_follow_rack_name() {
        let config = Config::from_map(&env(&[("RACK", "staging")])).unwrap();
        assert_eq!(config.rack, "staging");
        assert_eq!(config.provider, ProviderKind::Local);
        assert_eq!(config.dynamo_builds, "staging-builds");
        assert_eq!(config.settings_bucket, "staging-settings");
        assert_eq!(config.version, "dev");
        assert!(!config.autoscale);
    }

    #[test]
    fn build_cluster_defaults_to_cluster() {
        let config = Config::from_map(&env(&[("CLUSTER", "c-1")])).unwrap();
        assert_eq!(config.build_cluster, "c-1");

        let config =
            Config::from_map(&env(&[("CLUSTER", "c-1"), ("BUILD_CLUSTER", "b-1")])).unwrap();
        assert_eq!(config.build_cluster, "b-1");
    }

    #[test]
    fn flags_require_exact_true() {
        let config = Config::from_map(&env(&[
            ("AUTOSCALE", "true"),
            ("DEVELOPMENT", "yes"),
            ("SPOT_INSTANCES", "TRUE"),
        ]))
        .unwrap();
        assert!(config.autoscale);
        assert!(!config.development);
        assert!(!config.spot_instances);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = Config::from_map(&env(&[("PROVIDER", "gcp")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PROVIDER", .. }));
    }

    #[test]
    fn bad_on_demand_count_is_rejected() {
        let err = Config::from_map(&env(&[("ON_DEMAND_MIN_COUNT", "two")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ON_DEMAND_MIN_COUNT", .. }));
    }

    #[test]
    fn redacted_hides_credentials() {
        let config = Config::from_map(&env(&[
            ("AWS_SECRET", "shh"),
            ("PASSWORD", "hunter2"),
        ]))
        .unwrap();
        let shown = config.redacted().to_toml_string().unwrap();
        assert!(!shown.contains("shh"));
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("rack = \"convox\""));
    }

    #[test]
    fn local_config_names_resources_after_rack() {
        let config = Config::local("convox");
        assert_eq!(config.provider, ProviderKind::Test);
        assert_eq!(config.cluster, "convox-cluster");
        assert_eq!(config.app_stack("httpd"), "convox-httpd");
        assert_eq!(config.encryption_key.as_deref(), Some("convox-key"));
    }
}
