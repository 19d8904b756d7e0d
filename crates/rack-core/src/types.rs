//! Entity types surfaced by the provider.
//!
//! These are the logical views returned to callers. Their persisted forms
//! (table items, stack parameters, object-store blobs) are private to the
//! provider and converted at the edges.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::env::Environment;

pub type Tags = BTreeMap<String, String>;

// ── App ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    /// "1" or "2".
    pub generation: String,
    /// Currently active release id, empty when nothing was promoted yet.
    pub release: String,
    pub status: String,
    pub outputs: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, String>,
    pub tags: Tags,
}

impl App {
    pub fn is_gen2(&self) -> bool {
        self.generation == "2"
    }

    pub fn output(&self, key: &str) -> &str {
        self.outputs.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn parameter(&self, key: &str) -> &str {
        self.parameters.get(key).map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCreateOptions {
    /// Defaults to "2" when unset.
    pub generation: Option<String>,
}

// ── Build ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Created,
    Running,
    Complete,
    Failed,
    Timeout,
}

impl BuildStatus {
    /// Terminal builds are immutable apart from their release.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown build status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    pub app: String,
    pub description: String,
    /// Opaque log location, usually `object:///…`.
    pub logs: String,
    pub manifest: String,
    pub release: String,
    pub reason: String,
    pub status: BuildStatus,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub tags: Tags,
}

impl Build {
    pub fn new(app: &str) -> Self {
        Self {
            id: crate::id::build_id(),
            app: app.to_string(),
            description: String::new(),
            logs: String::new(),
            manifest: String::new(),
            release: String::new(),
            reason: String::new(),
            status: BuildStatus::Created,
            started: Utc::now(),
            ended: None,
            tags: Tags::new(),
        }
    }
}

/// Where a build's source comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildSource {
    /// Remote git or tarball URL passed straight to the build container.
    Url(String),
    /// Tarball bytes streamed to the build container's stdin.
    Tar(Vec<u8>),
    /// Content index whose bodies already live in the settings bucket.
    Index(crate::index::Index),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildCreateOptions {
    pub manifest: Option<String>,
    pub description: String,
    /// Reuse layers from earlier builds.
    pub cache: bool,
    pub development: bool,
}

/// Fields the build container reports back through its callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildUpdateOptions {
    pub status: Option<BuildStatus>,
    pub manifest: Option<String>,
    pub release: Option<String>,
    pub reason: Option<String>,
    pub ended: Option<DateTime<Utc>>,
}

// ── Release ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub id: String,
    pub app: String,
    pub build: String,
    /// Plaintext env; only populated after decryption.
    pub env: Environment,
    pub manifest: String,
    pub created: DateTime<Utc>,
}

impl Release {
    pub fn new(app: &str) -> Self {
        Self {
            id: crate::id::release_id(),
            app: app.to_string(),
            build: String::new(),
            env: Environment::default(),
            manifest: String::new(),
            created: Utc::now(),
        }
    }
}

/// The release with the largest creation time, if any.
pub fn latest_release(releases: &[Release]) -> Option<&Release> {
    releases.iter().max_by_key(|r| r.created)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseCreateOptions {
    pub build: Option<String>,
    pub env: Option<Environment>,
}

// ── Process ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: String,
    pub app: String,
    pub name: String,
    pub release: String,
    pub command: String,
    pub host: String,
    pub instance: String,
    pub image: String,
    pub ports: Vec<String>,
    /// Reserved memory in MB.
    pub memory: u64,
    pub cpu: u64,
    pub status: String,
    pub started: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessStats {
    pub cpu_percent: f64,
    /// Fraction of the memory limit in use, 0.0..=1.0.
    pub memory: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessRunOptions {
    pub service: String,
    pub command: Option<String>,
    pub release: Option<String>,
    pub memory: Option<u64>,
    pub environment: BTreeMap<String, String>,
    /// Attach a terminal of this size.
    pub height: Option<u16>,
    pub width: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub tty: bool,
    pub height: Option<u16>,
    pub width: Option<u16>,
}

// ── Resource ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub stack: String,
    pub url: String,
    pub apps: Vec<String>,
    pub outputs: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, String>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceType {
    pub name: String,
    pub parameters: Vec<ResourceParameter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceParameter {
    pub name: String,
    pub default: String,
    pub description: String,
}

// ── Certificates, objects, registries ──────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: String,
    pub arn: String,
    pub domain: String,
    pub domains: Vec<String>,
    pub expiration: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectStoreOptions {
    pub public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    pub server: String,
    pub username: String,
    pub password: String,
}

// ── Instances & system ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub agent: bool,
    pub status: String,
    pub private_ip: String,
    pub public_ip: String,
    pub processes: u32,
    /// Fraction of registered cpu in use, 0.0..=1.0.
    pub cpu: f64,
    pub memory: f64,
    pub started: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct System {
    pub name: String,
    pub count: u32,
    pub domain: String,
    pub outputs: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, String>,
    pub provider: String,
    pub region: String,
    pub status: String,
    #[serde(rename = "type")]
    pub instance_type: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemUpdateOptions {
    pub count: Option<u32>,
    pub instance_type: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub cluster_cpu: i64,
    pub cluster_memory: i64,
    pub instance_cpu: i64,
    pub instance_memory: i64,
    pub process_count: i64,
    pub process_cpu: i64,
    pub process_memory: i64,
    pub process_width: i64,
}

// ── Logs & metrics ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogsOptions {
    pub filter: Option<String>,
    pub follow: bool,
    /// Defaults to two minutes before now.
    pub since: Option<DateTime<Utc>>,
    pub prefix: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsOptions {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub period_secs: Option<u64>,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub values: Vec<MetricValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub time: DateTime<Utc>,
    pub average: f64,
    pub minimum: f64,
    pub maximum: f64,
}

// ── Events ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub action: String,
    pub status: String,
    pub data: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            status: "success".to_string(),
            data: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn latest_of_empty_is_none() {
        assert!(latest_release(&[]).is_none());
    }

    #[test]
    fn latest_picks_largest_created() {
        let now = Utc::now();
        let mut a = Release::new("app");
        a.created = now - Duration::seconds(30);
        let mut b = Release::new("app");
        b.created = now;
        let mut c = Release::new("app");
        c.created = now - Duration::seconds(60);

        let list = vec![a, b.clone(), c];
        assert_eq!(latest_release(&list).map(|r| r.id.as_str()), Some(b.id.as_str()));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!BuildStatus::Created.is_terminal());
        assert!(!BuildStatus::Running.is_terminal());
        assert!(BuildStatus::Complete.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
        assert!(BuildStatus::Timeout.is_terminal());
    }

    #[test]
    fn build_status_parses_lowercase_names() {
        assert_eq!("timeout".parse::<BuildStatus>(), Ok(BuildStatus::Timeout));
        assert!("done".parse::<BuildStatus>().is_err());
    }

    #[test]
    fn resource_kind_serializes_as_type() {
        let r = Resource {
            name: "db".into(),
            kind: "postgres".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["type"], "postgres");
    }
}
