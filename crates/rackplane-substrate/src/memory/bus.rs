use async_trait::async_trait;
use parking_lot::Mutex;

use super::random_uuid;
use crate::bus::EventBus;
use crate::error::SubstrateResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub subject: String,
    pub message: String,
}

pub struct MemoryBus {
    published: Mutex<Vec<Published>>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, topic: &str, subject: &str, message: &str) -> SubstrateResult<String> {
        self.published.lock().push(Published {
            topic: topic.to_string(),
            subject: subject.to_string(),
            message: message.to_string(),
        });
        Ok(random_uuid())
    }
}
