//! Log aggregator: groups of streams of timestamped events.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SubstrateResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub message: String,
    pub stream: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterLogEventsRequest {
    pub group: String,
    pub start_time: Option<i64>,
    pub filter_pattern: Option<String>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterLogEventsPage {
    pub events: Vec<LogEvent>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputLogEvent {
    pub timestamp: i64,
    pub message: String,
}

#[async_trait]
pub trait LogAggregator: Send + Sync {
    async fn filter_log_events(&self, req: FilterLogEventsRequest) -> SubstrateResult<FilterLogEventsPage>;

    async fn create_log_stream(&self, group: &str, stream: &str) -> SubstrateResult<()>;

    /// Current upload sequence token of a stream.
    async fn describe_sequence_token(&self, group: &str, stream: &str) -> SubstrateResult<Option<String>>;

    /// Append events. A stale `sequence_token` fails with
    /// `InvalidSequenceTokenException`. Returns the next token.
    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        events: Vec<InputLogEvent>,
        sequence_token: Option<String>,
    ) -> SubstrateResult<String>;
}
