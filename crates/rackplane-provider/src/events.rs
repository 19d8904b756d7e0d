use async_trait::async_trait;
use rack_core::Event;
use tracing::{debug, warn};

use crate::error::{ProviderError, ProviderResult};
use crate::ops::EventOps;
use crate::provider::Provider;

#[async_trait]
impl EventOps for Provider {
    async fn event_send(&self, mut event: Event, error: Option<&ProviderError>) -> ProviderResult<()> {
        if let Some(err) = error {
            event.status = "error".to_string();
            event.data.insert("message".to_string(), err.to_string());
        }

        let topic = &self.config().notification_topic;
        if topic.is_empty() {
            debug!(action = %event.action, "no notification topic, event dropped");
            return Ok(());
        }

        let message = serde_json::to_string(&event)?;
        let id = self
            .call(self.substrate().bus.publish(topic, &event.action, &message))
            .await?;
        debug!(action = %event.action, status = %event.status, message_id = %id, "event published");
        Ok(())
    }
}

impl Provider {
    /// Publish an event, logging instead of failing.
    pub(crate) async fn notify(&self, event: Event, error: Option<&ProviderError>) {
        let action = event.action.clone();
        if let Err(e) = self.event_send(event, error).await {
            warn!(%action, error = %e, "event publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestRack;

    #[tokio::test]
    async fn success_event_is_published_to_the_notification_topic() {
        let rack = TestRack::new();
        rack.provider
            .event_send(Event::new("app:create").with("name", "httpd"), None)
            .await
            .unwrap();

        let published = rack.cloud.bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "convox-notifications");
        assert_eq!(published[0].subject, "app:create");
        let body: serde_json::Value = serde_json::from_str(&published[0].message).unwrap();
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["name"], "httpd");
    }

    #[tokio::test]
    async fn error_marks_the_event_failed() {
        let rack = TestRack::new();
        let err = ProviderError::validation("bad input");
        rack.provider.event_send(Event::new("build:create"), Some(&err)).await.unwrap();

        let body: serde_json::Value = serde_json::from_str(&rack.cloud.bus.published()[0].message).unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["data"]["message"], "bad input");
    }
}
