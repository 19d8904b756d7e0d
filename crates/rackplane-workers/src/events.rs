//! Substrate events forwarded into app log groups.
//!
//! ```text
//!   CloudformationEvents queue ──┐
//!   AccountEvents queue ─────────┼──▶ AppLogs ──▶ {app log group}/system/{nanos}
//!   scheduler service events ────┘      (one stream per app, sequence tokens)
//! ```
//!
//! Queue messages are deleted only after their handler succeeds; a failed
//! message becomes visible again after the visibility timeout.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rackplane_provider::Provider;
use rackplane_substrate::{InputLogEvent, ReceiveOptions, ServiceEvent};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::runner::Worker;

/// Scheduler events forwarded per task-state change.
const RECENT_SERVICE_EVENTS: usize = 5;

const TASK_STATE_CHANGE: &str = "ECS Task State Change";

/// Forwarded event ids remembered for dedup; the oldest are forgotten first.
const FORWARDED_CAPACITY: usize = 4096;

// ── App log streams ────────────────────────────────────────────────

/// Bounded set of event ids already written, forgotten in insertion order.
struct ForwardedIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl ForwardedIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: String) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

struct AppStream {
    group: String,
    stream: String,
    token: Option<String>,
}

/// Per-app `system/{nanos}` streams, shared by every event source.
pub struct AppLogs {
    provider: Provider,
    streams: tokio::sync::Mutex<HashMap<String, AppStream>>,
    forwarded: parking_lot::Mutex<ForwardedIds>,
}

impl AppLogs {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            streams: tokio::sync::Mutex::new(HashMap::new()),
            forwarded: parking_lot::Mutex::new(ForwardedIds::new(FORWARDED_CAPACITY)),
        }
    }

    async fn open(&self, app: &str) -> anyhow::Result<AppStream> {
        let group = self.provider.app_resource(app, "LogGroup").await?;
        let stream = format!("system/{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
        self.provider
            .call(self.provider.substrate().logs.create_log_stream(&group, &stream))
            .await?;
        debug!(%app, %group, %stream, "log stream created");
        Ok(AppStream {
            group,
            stream,
            token: None,
        })
    }

    /// Append `events` to the app's stream in timestamp order.
    ///
    /// A stale sequence token is refreshed from the aggregator and the put
    /// retried once.
    pub async fn append(&self, app: &str, mut events: Vec<InputLogEvent>) -> anyhow::Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        events.sort_by_key(|e| e.timestamp);

        let mut streams = self.streams.lock().await;
        if !streams.contains_key(app) {
            let opened = self.open(app).await?;
            streams.insert(app.to_string(), opened);
        }
        let Some(stream) = streams.get_mut(app) else {
            anyhow::bail!("log stream for {app} vanished");
        };

        let logs = &self.provider.substrate().logs;
        let put = logs.put_log_events(&stream.group, &stream.stream, events.clone(), stream.token.clone());
        let next = match self.provider.call(put).await {
            Ok(next) => next,
            Err(e) if e.is_code("InvalidSequenceTokenException") => {
                debug!(%app, stream = %stream.stream, "sequence token stale, refreshing");
                let token = self
                    .provider
                    .call(logs.describe_sequence_token(&stream.group, &stream.stream))
                    .await?;
                self.provider
                    .call(logs.put_log_events(&stream.group, &stream.stream, events, token))
                    .await?
            }
            Err(e) => return Err(e.into()),
        };
        stream.token = Some(next);
        Ok(())
    }

    /// Forward scheduler events created after `since` that were not written
    /// before. Ids are marked written only once the append succeeds.
    pub async fn forward_service_events<'a>(
        &self,
        app: &str,
        events: impl IntoIterator<Item = &'a ServiceEvent>,
        since: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        let (ids, fresh): (Vec<String>, Vec<InputLogEvent>) = {
            let forwarded = self.forwarded.lock();
            let mut seen = HashSet::new();
            events
                .into_iter()
                .filter(|e| e.created_at > since && !forwarded.contains(&e.id) && seen.insert(e.id.as_str()))
                .map(|e| {
                    let line = InputLogEvent {
                        timestamp: e.created_at.timestamp_millis(),
                        message: format!("aws/ecs {}", e.message),
                    };
                    (e.id.clone(), line)
                })
                .unzip()
        };
        let count = fresh.len();
        self.append(app, fresh).await?;

        let mut forwarded = self.forwarded.lock();
        for id in ids {
            forwarded.insert(id);
        }
        debug!(%app, count, remembered = forwarded.len(), "service events forwarded");
        Ok(count)
    }
}

/// `{rack}-{app}-Service{Name}-{suffix}` → `app`.
fn app_from_service<'a>(rack: &str, service: &'a str) -> Option<&'a str> {
    let rest = service.strip_prefix(rack)?.strip_prefix('-')?;
    let (app, _) = rest.split_once("-Service")?;
    (!app.is_empty()).then_some(app)
}

// ── Queue messages ─────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Notification {
    message: String,
}

/// Fields of a stack-lifecycle notification: lines of `Key='value'`.
fn parse_stack_event(body: &str) -> anyhow::Result<BTreeMap<String, String>> {
    let notification: Notification = serde_json::from_str(body)?;
    Ok(notification
        .message
        .lines()
        .filter_map(|line| line.split_once("='"))
        .map(|(key, value)| {
            let value = value.strip_suffix('\'').unwrap_or(value);
            (key.trim().to_string(), value.to_string())
        })
        .collect())
}

#[derive(Deserialize)]
struct AccountEvent {
    #[serde(rename = "detail-type")]
    detail_type: String,
    #[serde(default)]
    detail: serde_json::Value,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct TaskStateChange {
    #[serde(default)]
    group: String,
    #[serde(default)]
    last_status: String,
}

/// The two queues the rack stack routes events into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventQueue {
    StackEvents,
    AccountEvents,
}

impl EventQueue {
    /// Logical id of the queue in the rack stack.
    fn resource(self) -> &'static str {
        match self {
            Self::StackEvents => "CloudformationEvents",
            Self::AccountEvents => "AccountEvents",
        }
    }
}

pub struct QueueConsumer {
    provider: Provider,
    logs: Arc<AppLogs>,
    kind: EventQueue,
    queue: Option<String>,
}

impl QueueConsumer {
    pub fn new(provider: Provider, logs: Arc<AppLogs>, kind: EventQueue) -> Self {
        Self {
            provider,
            logs,
            kind,
            queue: None,
        }
    }

    async fn queue(&mut self) -> anyhow::Result<String> {
        if let Some(queue) = &self.queue {
            return Ok(queue.clone());
        }
        let rack = &self.provider.config().rack;
        let queue = self.provider.stack_resource(rack, self.kind.resource()).await?;
        info!(queue = %queue, kind = ?self.kind, "consuming event queue");
        self.queue = Some(queue.clone());
        Ok(queue)
    }

    async fn handle(&self, body: &str) -> anyhow::Result<()> {
        match self.kind {
            EventQueue::StackEvents => self.handle_stack_event(body).await,
            EventQueue::AccountEvents => self.handle_account_event(body).await,
        }
    }

    async fn handle_stack_event(&self, body: &str) -> anyhow::Result<()> {
        let fields = parse_stack_event(body)?;
        let field = |key: &str| fields.get(key).map(String::as_str).unwrap_or_default();
        let rack = &self.provider.config().rack;

        let stack = field("StackName");
        if stack == rack.as_str() {
            return Ok(());
        }
        let Some(app) = stack.strip_prefix(rack.as_str()).and_then(|s| s.strip_prefix('-')) else {
            debug!(%stack, "stack event outside this rack");
            return Ok(());
        };

        let line = format!(
            "aws/cloudformation {} {} {}",
            field("ResourceStatus"),
            field("LogicalResourceId"),
            field("ResourceStatusReason")
        );
        let event = InputLogEvent {
            timestamp: Utc::now().timestamp_millis(),
            message: line.trim_end().to_string(),
        };
        self.logs.append(app, vec![event]).await
    }

    async fn handle_account_event(&self, body: &str) -> anyhow::Result<()> {
        let event: AccountEvent = serde_json::from_str(body)?;
        if event.detail_type != TASK_STATE_CHANGE {
            return Ok(());
        }
        let change: TaskStateChange = serde_json::from_value(event.detail).unwrap_or_default();
        let Some(service) = change.group.strip_prefix("service:") else {
            return Ok(());
        };
        if change.last_status != "PENDING" {
            return Ok(());
        }
        let config = self.provider.config();
        let Some(app) = app_from_service(&config.rack, service) else {
            return Ok(());
        };

        let services = self
            .provider
            .call(
                self.provider
                    .substrate()
                    .scheduler
                    .describe_services(&config.cluster, &[service.to_string()]),
            )
            .await?;
        let Some(service) = services.into_iter().next() else {
            return Ok(());
        };

        let mut recent: Vec<&ServiceEvent> = service.events.iter().collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recent.truncate(RECENT_SERVICE_EVENTS);
        self.logs
            .forward_service_events(app, recent, DateTime::<Utc>::MIN_UTC)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Worker for QueueConsumer {
    fn name(&self) -> &'static str {
        match self.kind {
            EventQueue::StackEvents => "events.stack",
            EventQueue::AccountEvents => "events.account",
        }
    }

    /// Receives long-poll, so there is no pause between them.
    fn interval(&self) -> Duration {
        Duration::ZERO
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let queue = self.queue().await?;
        let queues = &self.provider.substrate().queues;
        let messages = self
            .provider
            .call(queues.receive(&queue, ReceiveOptions::default()))
            .await?;

        for message in messages {
            match self.handle(&message.body).await {
                Ok(()) => self.provider.call(queues.delete(&queue, &message.receipt)).await?,
                Err(e) => warn!(%queue, message = %message.id, error = %e, "event handler failed"),
            }
        }
        Ok(())
    }
}

// ── Service event poller ───────────────────────────────────────────

/// Polls every cluster service and forwards events newer than startup.
pub struct ServiceEvents {
    provider: Provider,
    logs: Arc<AppLogs>,
    started: DateTime<Utc>,
}

impl ServiceEvents {
    pub fn new(provider: Provider, logs: Arc<AppLogs>) -> Self {
        Self {
            provider: provider.without_cache(),
            logs,
            started: Utc::now(),
        }
    }

    pub fn since(mut self, started: DateTime<Utc>) -> Self {
        self.started = started;
        self
    }
}

#[async_trait]
impl Worker for ServiceEvents {
    fn name(&self) -> &'static str {
        "events.services"
    }

    fn interval(&self) -> Duration {
        self.provider.config().service_events_interval()
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let config = self.provider.config();
        for service in self.provider.cluster_services(&config.cluster).await? {
            let Some(app) = app_from_service(&config.rack, &service.name) else {
                continue;
            };
            if let Err(e) = self.logs.forward_service_events(app, &service.events, self.started).await {
                warn!(%app, service = %service.name, error = %e, "service events not forwarded");
            }
        }
        Ok(())
    }
}
