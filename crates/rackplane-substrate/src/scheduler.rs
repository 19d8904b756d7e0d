//! Container scheduler: tasks, task definitions, services, container
//! instances, plus exec sessions and stats on running containers.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::SubstrateResult;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDefinition {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// MB.
    pub memory: Option<i64>,
    pub cpu: Option<i64>,
    pub port_mappings: Vec<PortMapping>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub arn: String,
    pub family: String,
    pub containers: Vec<ContainerDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContainer {
    pub name: String,
    pub last_status: String,
    pub network_bindings: Vec<PortMapping>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerOverride {
    pub name: String,
    pub command: Option<Vec<String>>,
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub arn: String,
    pub cluster: String,
    pub task_definition_arn: String,
    pub container_instance_arn: Option<String>,
    pub last_status: String,
    pub desired_status: String,
    pub started_by: String,
    /// `service:<name>` for service-owned tasks.
    pub group: String,
    pub started_at: Option<DateTime<Utc>>,
    pub containers: Vec<TaskContainer>,
    pub overrides: Vec<ContainerOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInstance {
    pub arn: String,
    pub ec2_instance_id: String,
    pub agent_connected: bool,
    /// `ACTIVE` or `DRAINING`.
    pub status: String,
    pub registered_cpu: i64,
    pub registered_memory: i64,
    pub remaining_cpu: i64,
    pub remaining_memory: i64,
    pub running_tasks: i64,
    pub registered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLoadBalancer {
    pub container_name: String,
    pub container_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDeployment {
    pub task_definition: String,
    pub desired_count: i64,
    pub running_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub arn: String,
    pub name: String,
    pub task_definition: String,
    pub desired_count: i64,
    pub running_count: i64,
    pub deployments: Vec<ServiceDeployment>,
    pub load_balancers: Vec<ServiceLoadBalancer>,
    pub events: Vec<ServiceEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListTasksFilter {
    pub service: Option<String>,
    pub started_by: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTaskRequest {
    pub cluster: String,
    pub task_definition: String,
    pub started_by: String,
    pub overrides: Vec<ContainerOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTaskResult {
    pub tasks: Vec<Task>,
    /// Placement failure reasons such as `RESOURCE:MEMORY`.
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub cluster: String,
    pub task_arn: String,
    pub command: Vec<String>,
    pub tty: bool,
    pub height: Option<u16>,
    pub width: Option<u16>,
}

/// Resource usage snapshot for the first container of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
}

pub type ByteReader = Pin<Box<dyn AsyncRead + Send>>;
pub type ByteWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A started exec. The session ends when `exit` resolves; `output` carries
/// interleaved stdout and stderr.
pub struct ExecSession {
    pub input: ByteWriter,
    pub output: ByteReader,
    pub exit: BoxFuture<'static, SubstrateResult<i32>>,
}

#[async_trait]
pub trait ContainerScheduler: Send + Sync {
    async fn list_tasks(&self, cluster: &str, filter: ListTasksFilter) -> SubstrateResult<Vec<String>>;

    /// Unknown arns are silently skipped.
    async fn describe_tasks(&self, cluster: &str, arns: &[String]) -> SubstrateResult<Vec<Task>>;

    async fn describe_task_definition(&self, arn: &str) -> SubstrateResult<TaskDefinition>;

    /// Returns the new revision's arn.
    async fn register_task_definition(&self, def: TaskDefinition) -> SubstrateResult<String>;

    async fn run_task(&self, req: RunTaskRequest) -> SubstrateResult<RunTaskResult>;

    async fn stop_task(&self, cluster: &str, arn: &str) -> SubstrateResult<()>;

    async fn list_container_instances(&self, cluster: &str) -> SubstrateResult<Vec<String>>;

    async fn describe_container_instances(
        &self,
        cluster: &str,
        arns: &[String],
    ) -> SubstrateResult<Vec<ContainerInstance>>;

    async fn list_services(&self, cluster: &str) -> SubstrateResult<Vec<String>>;

    async fn describe_services(&self, cluster: &str, names: &[String]) -> SubstrateResult<Vec<Service>>;

    async fn exec(&self, req: ExecRequest) -> SubstrateResult<ExecSession>;

    async fn stats(&self, cluster: &str, task_arn: &str) -> SubstrateResult<ContainerStats>;
}
