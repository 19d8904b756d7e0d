//! Virtual machines and key pairs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SubstrateResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeInstance {
    pub id: String,
    pub instance_type: String,
    pub private_ip: String,
    pub public_ip: String,
    pub state: String,
    pub launch_time: Option<DateTime<Utc>>,
    pub spot: bool,
}

#[async_trait]
pub trait Compute: Send + Sync {
    /// Instances tagged with `Rack=<rack>`.
    async fn describe_rack_instances(&self, rack: &str) -> SubstrateResult<Vec<ComputeInstance>>;

    /// Create a key pair and return its private key material.
    async fn create_key_pair(&self, name: &str) -> SubstrateResult<String>;
}
