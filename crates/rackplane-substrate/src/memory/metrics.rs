use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::SubstrateResult;
use crate::metrics::*;

pub struct MemoryMetrics {
    series: Mutex<BTreeMap<String, Vec<Datapoint>>>,
    queries: Mutex<Vec<MetricQuery>>,
}

impl Default for MemoryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self {
            series: Mutex::new(BTreeMap::new()),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, name: &str, points: Vec<Datapoint>) {
        self.series.lock().insert(name.to_string(), points);
    }

    pub fn queries(&self) -> Vec<MetricQuery> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl MetricsSource for MemoryMetrics {
    async fn get_statistics(&self, query: MetricQuery) -> SubstrateResult<Vec<Datapoint>> {
        let points = self
            .series
            .lock()
            .get(&query.name)
            .map(|points| {
                points
                    .iter()
                    .filter(|p| p.timestamp >= query.start && p.timestamp <= query.end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        self.queries.lock().push(query);
        Ok(points)
    }
}
