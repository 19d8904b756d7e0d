//! Declarative stack orchestration.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SubstrateResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stack {
    pub name: String,
    pub id: String,
    pub status: String,
    pub status_reason: String,
    pub parameters: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEvent {
    pub id: String,
    pub logical_id: String,
    pub resource_type: String,
    pub status: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackResource {
    pub logical_id: String,
    pub physical_id: String,
    pub resource_type: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    /// Keep the template the stack already runs.
    Previous,
    Url(String),
    Body(String),
}

/// One parameter in an update. `None` submits `UsePreviousValue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterValue {
    pub key: String,
    pub value: Option<String>,
}

impl ParameterValue {
    pub fn set(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: Some(value.to_string()),
        }
    }

    pub fn previous(key: &str) -> Self {
        Self {
            key: key.to_string(),
            value: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateStackRequest {
    pub name: String,
    pub template: TemplateSource,
    pub parameters: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub notification_topic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStackRequest {
    pub name: String,
    pub template: TemplateSource,
    pub parameters: Vec<ParameterValue>,
    pub notification_topic: Option<String>,
}

#[async_trait]
pub trait StackEngine: Send + Sync {
    /// Describe one stack by name, or every stack when `name` is `None`.
    /// A missing named stack is a `ValidationError`.
    async fn describe_stacks(&self, name: Option<&str>) -> SubstrateResult<Vec<Stack>>;

    /// Most recent first.
    async fn describe_stack_events(&self, name: &str) -> SubstrateResult<Vec<StackEvent>>;

    async fn describe_stack_resources(&self, name: &str) -> SubstrateResult<Vec<StackResource>>;

    async fn get_template(&self, name: &str) -> SubstrateResult<String>;

    /// Returns the new stack id.
    async fn create_stack(&self, req: CreateStackRequest) -> SubstrateResult<String>;

    async fn update_stack(&self, req: UpdateStackRequest) -> SubstrateResult<()>;

    async fn delete_stack(&self, name: &str) -> SubstrateResult<()>;

    async fn cancel_update_stack(&self, name: &str) -> SubstrateResult<()>;
}
