//! Message queues with visibility timeouts.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::SubstrateResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub receipt: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    pub max_messages: usize,
    pub visibility_timeout: Duration,
    pub wait: Duration,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: 10,
            visibility_timeout: Duration::from_secs(20),
            wait: Duration::from_secs(10),
        }
    }
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Long-poll for up to `opts.max_messages`. Received messages stay
    /// invisible for the visibility timeout unless deleted.
    async fn receive(&self, queue: &str, opts: ReceiveOptions) -> SubstrateResult<Vec<QueueMessage>>;

    async fn delete(&self, queue: &str, receipt: &str) -> SubstrateResult<()>;
}
