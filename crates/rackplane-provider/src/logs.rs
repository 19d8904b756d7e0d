//! Log tailing over the aggregator's filter API.
//!
//! ```text
//!   filter(start) ──► page ──► page ──► … ──► sort ──► cursor = max(ts)+1ms
//!        ▲                                                     │
//!        └──────────────── sleep 200ms (follow) ◄──────────────┘
//! ```

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use rack_core::LogsOptions;
use rackplane_stream::{DEFAULT_PIPE_CAPACITY, PipeReader, PipeWriter, pipe};
use rackplane_substrate::{FilterLogEventsRequest, LogEvent};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{ProviderError, ProviderResult};
use crate::provider::Provider;

const FOLLOW_POLL: Duration = Duration::from_millis(200);
const THROTTLE_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_SINCE: chrono::Duration = chrono::Duration::minutes(2);

/// `convox/{service}/{task-id}` → `{service}/{first 12 of task id}`.
fn stream_prefix(stream: &str) -> Option<String> {
    let mut parts = stream.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("convox"), Some(service), Some(task), None) => {
            let short: String = task.chars().filter(|c| *c != '-').take(12).collect();
            Some(format!("{service}/{short}"))
        }
        _ => None,
    }
}

/// One output line: RFC3339 timestamp, optional stream prefix, message.
pub fn log_line(event: &LogEvent, prefix: bool) -> String {
    let at: DateTime<Utc> = Utc.timestamp_millis_opt(event.timestamp).single().unwrap_or_default();
    let at = at.to_rfc3339_opts(SecondsFormat::Secs, true);
    match prefix.then(|| stream_prefix(&event.stream)).flatten() {
        Some(p) => format!("{at} {p} {}\n", event.message),
        None => format!("{at} {}\n", event.message),
    }
}

impl Provider {
    /// Tail `group` into a pipe. The tail stops when the reader is dropped,
    /// the context is canceled, or (without follow) after one pass.
    pub(crate) fn subscribe_logs(&self, group: String, opts: LogsOptions) -> PipeReader {
        let (writer, reader) = pipe(DEFAULT_PIPE_CAPACITY);
        let provider = self.clone();
        tokio::spawn(async move {
            match provider.tail_logs(&group, &opts, writer).await {
                Ok(()) => debug!(%group, "log tail finished"),
                Err(e) => warn!(%group, error = %e, "log tail failed"),
            }
        });
        reader
    }

    async fn tail_logs(&self, group: &str, opts: &LogsOptions, mut writer: PipeWriter) -> ProviderResult<()> {
        let since = opts.since.unwrap_or_else(|| Utc::now() - DEFAULT_SINCE);
        let mut start = since.timestamp_millis();

        loop {
            let Some(end) = self.fetch_logs(group, opts, start, &mut writer).await? else {
                return Ok(());
            };
            if !opts.follow {
                return Ok(());
            }
            start = end;
            if !self.context().sleep(FOLLOW_POLL).await {
                return Ok(());
            }
        }
    }

    /// One pass over every page from `start`, written in timestamp order.
    /// Returns the next cursor, or `None` once the reader has gone away.
    async fn fetch_logs(
        &self,
        group: &str,
        opts: &LogsOptions,
        start: i64,
        writer: &mut PipeWriter,
    ) -> ProviderResult<Option<i64>> {
        let mut req = FilterLogEventsRequest {
            group: group.to_string(),
            start_time: Some(start),
            filter_pattern: opts.filter.clone().filter(|f| !f.is_empty()),
            next_token: None,
        };

        // Pages interleave streams, so order only holds across the whole pass.
        let mut events: Vec<LogEvent> = Vec::new();
        loop {
            let page = match self.call(self.substrate().logs.filter_log_events(req.clone())).await {
                Ok(page) => page,
                Err(e) if e.is_code("ThrottlingException") => {
                    debug!(%group, "log filter throttled, backing off");
                    if !self.context().sleep(THROTTLE_BACKOFF).await {
                        return Err(ProviderError::Canceled);
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            events.extend(page.events);
            match page.next_token {
                Some(token) => req.next_token = Some(token),
                None => break,
            }
        }

        events.sort_by_key(|e| e.timestamp);
        let mut end = start;
        for event in &events {
            end = end.max(event.timestamp + 1);
            if writer.write_all(log_line(event, opts.prefix).as_bytes()).await.is_err() {
                return Ok(None);
            }
        }
        Ok(Some(end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::AppOps;
    use crate::testing::TestRack;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

    const T0: i64 = 1_500_000_000_000;

    fn since() -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(T0).single()
    }

    async fn seeded(rack: &TestRack) -> String {
        rack.seed_app("httpd", "2");
        let group = rack.provider.app_resource("httpd", "LogGroup").await.unwrap();
        let logs = &rack.cloud.logs;
        logs.push(&group, "convox/web/0b412723-1289-4c3b-9a0e-8f7d6c5b4a39", T0 + 5000, "test five");
        logs.push(&group, "convox/web/0b412723-1289-4c3b-9a0e-8f7d6c5b4a39", T0 + 1000, "test one");
        logs.push(&group, "convox/worker/77f0c1d2-0000-4c3b-9a0e-8f7d6c5b4a39", T0 + 3000, "test three");
        logs.push(&group, "convox/worker/77f0c1d2-0000-4c3b-9a0e-8f7d6c5b4a39", T0 + 2000, "skip me");
        logs.push(&group, "system", T0 + 2000, "test two");
        logs.push(&group, "system", T0 + 4000, "test four");
        group
    }

    #[test]
    fn lines_carry_an_rfc3339_timestamp() {
        let event = LogEvent {
            timestamp: T0,
            message: "hello".into(),
            stream: "convox/web/0b412723-1289-4c3b".into(),
        };
        assert_eq!(log_line(&event, false), "2017-07-14T02:40:00Z hello\n");
        assert_eq!(log_line(&event, true), "2017-07-14T02:40:00Z web/0b4127231289 hello\n");
    }

    #[tokio::test]
    async fn filtered_pass_writes_events_in_timestamp_order() {
        let rack = TestRack::new();
        seeded(&rack).await;

        let opts = LogsOptions {
            filter: Some("test".into()),
            since: since(),
            ..Default::default()
        };
        let mut out = String::new();
        rack.provider
            .app_logs("httpd", opts)
            .await
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();

        let messages: Vec<_> = out.lines().map(|l| l.split_once(' ').unwrap().1).collect();
        assert_eq!(messages, ["test one", "test two", "test three", "test four", "test five"]);
        assert!(out.lines().all(|l| l.starts_with("2017-07-14T02:40:0")));
    }

    #[tokio::test(start_paused = true)]
    async fn throttling_backs_off_and_pages_are_followed() {
        let rack = TestRack::new();
        seeded(&rack).await;
        rack.cloud.logs.throttle_next(1);
        rack.cloud.logs.set_page_size(2);

        let opts = LogsOptions {
            since: since(),
            ..Default::default()
        };
        let mut out = String::new();
        rack.provider
            .app_logs("httpd", opts)
            .await
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();

        assert_eq!(out.lines().count(), 6);
        assert_eq!(rack.cloud.logs.filter_calls(), 4);
    }

    #[tokio::test]
    async fn interleaved_pages_are_merged_in_timestamp_order() {
        let rack = TestRack::new();
        seeded(&rack).await;
        rack.cloud.logs.set_page_size(2);

        let opts = LogsOptions {
            since: since(),
            ..Default::default()
        };
        let mut out = String::new();
        rack.provider
            .app_logs("httpd", opts)
            .await
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();

        let messages: Vec<_> = out.lines().map(|l| l.split_once(' ').unwrap().1).collect();
        assert_eq!(
            messages,
            ["test one", "skip me", "test two", "test three", "test four", "test five"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn follow_advances_the_cursor() {
        let rack = TestRack::new();
        let group = seeded(&rack).await;

        let opts = LogsOptions {
            filter: Some("test".into()),
            since: since(),
            follow: true,
            prefix: true,
        };
        let mut lines = BufReader::new(rack.provider.app_logs("httpd", opts).await.unwrap()).lines();
        for _ in 0..5 {
            lines.next_line().await.unwrap().unwrap();
        }

        rack.cloud.logs.push(&group, "system", T0 + 9000, "test six");
        let next = lines.next_line().await.unwrap().unwrap();
        assert!(next.ends_with(" test six"), "{next}");
    }
}
