//! Metrics source.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SubstrateResult;

#[derive(Debug, Clone, PartialEq)]
pub struct MetricQuery {
    pub namespace: String,
    pub name: String,
    pub dimensions: Vec<(String, String)>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub period_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Datapoint {
    pub timestamp: DateTime<Utc>,
    pub average: f64,
    pub minimum: f64,
    pub maximum: f64,
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn get_statistics(&self, query: MetricQuery) -> SubstrateResult<Vec<Datapoint>>;
}
