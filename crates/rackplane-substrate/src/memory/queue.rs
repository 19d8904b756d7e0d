use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::random_hex;
use crate::error::SubstrateResult;
use crate::queue::*;

struct InFlight {
    message: QueueMessage,
    visible_at: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueueMessage>,
    in_flight: BTreeMap<String, InFlight>,
    deleted: Vec<String>,
}

impl QueueState {
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(r, _)| r.clone())
            .collect();
        for receipt in expired {
            if let Some(f) = self.in_flight.remove(&receipt) {
                self.ready.push_back(f.message);
            }
        }
    }
}

/// Queues with visibility timeouts and long polling.
pub struct MemoryQueues {
    queues: Mutex<BTreeMap<String, QueueState>>,
    arrived: Notify,
}

impl Default for MemoryQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueues {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(BTreeMap::new()),
            arrived: Notify::new(),
        }
    }

    pub fn send(&self, queue: &str, body: &str) {
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(QueueMessage {
                id: random_hex(16),
                receipt: String::new(),
                body: body.to_string(),
            });
        self.arrived.notify_waiters();
    }

    /// Messages not yet deleted, visible or not.
    pub fn pending(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .get(queue)
            .map(|q| q.ready.len() + q.in_flight.len())
            .unwrap_or(0)
    }

    /// Bodies of deleted messages, in deletion order.
    pub fn deleted(&self, queue: &str) -> Vec<String> {
        self.queues
            .lock()
            .get(queue)
            .map(|q| q.deleted.clone())
            .unwrap_or_default()
    }

    fn take(&self, queue: &str, opts: &ReceiveOptions) -> Vec<QueueMessage> {
        let now = Instant::now();
        let mut queues = self.queues.lock();
        let q = queues.entry(queue.to_string()).or_default();
        q.requeue_expired(now);

        let mut out = Vec::new();
        while out.len() < opts.max_messages {
            let Some(mut message) = q.ready.pop_front() else {
                break;
            };
            message.receipt = random_hex(24);
            q.in_flight.insert(
                message.receipt.clone(),
                InFlight {
                    message: message.clone(),
                    visible_at: now + opts.visibility_timeout,
                },
            );
            out.push(message);
        }
        out
    }
}

#[async_trait]
impl Queue for MemoryQueues {
    async fn receive(&self, queue: &str, opts: ReceiveOptions) -> SubstrateResult<Vec<QueueMessage>> {
        let notified = self.arrived.notified();
        let messages = self.take(queue, &opts);
        if !messages.is_empty() || opts.wait.is_zero() {
            return Ok(messages);
        }
        let _ = tokio::time::timeout(opts.wait, notified).await;
        Ok(self.take(queue, &opts))
    }

    async fn delete(&self, queue: &str, receipt: &str) -> SubstrateResult<()> {
        let mut queues = self.queues.lock();
        if let Some(q) = queues.get_mut(queue) {
            if let Some(f) = q.in_flight.remove(receipt) {
                q.deleted.push(f.message.body);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn undeleted_messages_reappear_after_visibility_timeout() {
        let queues = MemoryQueues::new();
        queues.send("q", "hello");

        let opts = ReceiveOptions {
            wait: Duration::ZERO,
            ..Default::default()
        };
        let first = queues.receive("q", opts).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(queues.receive("q", opts).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(21)).await;
        let again = queues.receive("q", opts).await.unwrap();
        assert_eq!(again[0].body, "hello");

        queues.delete("q", &again[0].receipt).await.unwrap();
        assert_eq!(queues.pending("q"), 0);
        assert_eq!(queues.deleted("q"), vec!["hello".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_receive_waits_for_long_poll() {
        let queues = MemoryQueues::new();
        let start = Instant::now();
        let got = queues.receive("q", ReceiveOptions::default()).await.unwrap();
        assert!(got.is_empty());
        assert!(start.elapsed() >= Duration::from_secs(10));
    }
}
