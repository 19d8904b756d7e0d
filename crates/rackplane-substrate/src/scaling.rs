//! Auto-scaling groups.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SubstrateResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInstance {
    pub id: String,
    /// `InService`, `Pending`, `Terminating`, …
    pub lifecycle_state: String,
    /// `Healthy` or `Unhealthy`.
    pub health_status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingGroup {
    pub name: String,
    pub desired_capacity: i64,
    pub min_size: i64,
    pub max_size: i64,
    pub instances: Vec<GroupInstance>,
}

#[async_trait]
pub trait ScalingGroups: Send + Sync {
    async fn describe_groups(&self, names: &[String]) -> SubstrateResult<Vec<ScalingGroup>>;

    async fn set_desired_capacity(&self, group: &str, desired: i64) -> SubstrateResult<()>;

    async fn set_instance_health(&self, instance: &str, status: &str, respect_grace_period: bool) -> SubstrateResult<()>;

    async fn terminate_instance(&self, instance: &str, decrement_desired: bool) -> SubstrateResult<()>;
}
