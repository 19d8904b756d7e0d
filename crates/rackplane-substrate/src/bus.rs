//! Publish/subscribe event bus.

use async_trait::async_trait;

use crate::error::SubstrateResult;

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Returns the message id.
    async fn publish(&self, topic: &str, subject: &str, message: &str) -> SubstrateResult<String>;
}
