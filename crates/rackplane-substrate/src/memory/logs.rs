use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{SubstrateError, SubstrateResult};
use crate::logs::*;

#[derive(Default)]
struct Stream {
    events: Vec<LogEvent>,
    token: u64,
}

#[derive(Default)]
struct State {
    groups: BTreeMap<String, BTreeMap<String, Stream>>,
    throttle_next: usize,
    page_size: Option<usize>,
    filter_calls: usize,
}

/// Log aggregator with sequence-token enforcement and injectable throttling.
/// Filter results come back stream by stream, not globally ordered.
pub struct MemoryLogs {
    state: Mutex<State>,
}

impl Default for MemoryLogs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogs {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    pub fn push(&self, group: &str, stream: &str, timestamp: i64, message: &str) {
        let mut state = self.state.lock();
        let s = state
            .groups
            .entry(group.to_string())
            .or_default()
            .entry(stream.to_string())
            .or_default();
        s.events.push(LogEvent {
            timestamp,
            message: message.to_string(),
            stream: stream.to_string(),
        });
    }

    /// Fail the next `n` filter calls with `ThrottlingException`.
    pub fn throttle_next(&self, n: usize) {
        self.state.lock().throttle_next = n;
    }

    pub fn set_page_size(&self, size: usize) {
        self.state.lock().page_size = Some(size.max(1));
    }

    pub fn filter_calls(&self) -> usize {
        self.state.lock().filter_calls
    }

    /// Every event in a group, timestamp ascending.
    pub fn events(&self, group: &str) -> Vec<LogEvent> {
        let state = self.state.lock();
        let mut events: Vec<LogEvent> = state
            .groups
            .get(group)
            .map(|streams| streams.values().flat_map(|s| s.events.clone()).collect())
            .unwrap_or_default();
        events.sort_by_key(|e| e.timestamp);
        events
    }

    pub fn streams(&self, group: &str) -> Vec<String> {
        self.state
            .lock()
            .groups
            .get(group)
            .map(|streams| streams.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LogAggregator for MemoryLogs {
    async fn filter_log_events(&self, req: FilterLogEventsRequest) -> SubstrateResult<FilterLogEventsPage> {
        let mut state = self.state.lock();
        state.filter_calls += 1;
        if state.throttle_next > 0 {
            state.throttle_next -= 1;
            return Err(SubstrateError::api("ThrottlingException", "Rate exceeded"));
        }

        let streams = state.groups.get(&req.group).ok_or_else(|| {
            SubstrateError::api("ResourceNotFoundException", "The specified log group does not exist.")
        })?;

        let mut events: Vec<LogEvent> = streams
            .values()
            .flat_map(|s| s.events.iter())
            .filter(|e| req.start_time.is_none_or(|start| e.timestamp >= start))
            .filter(|e| {
                req.filter_pattern
                    .as_deref()
                    .is_none_or(|p| p.is_empty() || e.message.contains(p.trim_matches('"')))
            })
            .cloned()
            .collect();
        // Pages walk the group stream by stream, so they interleave in time.
        events.sort_by(|a, b| a.stream.cmp(&b.stream).then(a.timestamp.cmp(&b.timestamp)));

        let offset: usize = req.next_token.as_deref().and_then(|t| t.parse().ok()).unwrap_or(0);
        let page = state.page_size.unwrap_or(10_000);
        let end = (offset + page).min(events.len());
        let next_token = (end < events.len()).then(|| end.to_string());

        Ok(FilterLogEventsPage {
            events: events.get(offset..end).map(<[LogEvent]>::to_vec).unwrap_or_default(),
            next_token,
        })
    }

    async fn create_log_stream(&self, group: &str, stream: &str) -> SubstrateResult<()> {
        let mut state = self.state.lock();
        let streams = state.groups.entry(group.to_string()).or_default();
        if streams.contains_key(stream) {
            return Err(SubstrateError::api(
                "ResourceAlreadyExistsException",
                "The specified log stream already exists",
            ));
        }
        streams.insert(stream.to_string(), Stream::default());
        Ok(())
    }

    async fn describe_sequence_token(&self, group: &str, stream: &str) -> SubstrateResult<Option<String>> {
        let state = self.state.lock();
        let s = state
            .groups
            .get(group)
            .and_then(|g| g.get(stream))
            .ok_or_else(|| SubstrateError::api("ResourceNotFoundException", "The specified log stream does not exist."))?;
        Ok((s.token > 0).then(|| s.token.to_string()))
    }

    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        events: Vec<InputLogEvent>,
        sequence_token: Option<String>,
    ) -> SubstrateResult<String> {
        let mut state = self.state.lock();
        let s = state
            .groups
            .get_mut(group)
            .and_then(|g| g.get_mut(stream))
            .ok_or_else(|| SubstrateError::api("ResourceNotFoundException", "The specified log stream does not exist."))?;

        let expected = (s.token > 0).then(|| s.token.to_string());
        if sequence_token != expected {
            return Err(SubstrateError::api(
                "InvalidSequenceTokenException",
                format!("The given sequenceToken is invalid. The next expected sequenceToken is: {}", expected.unwrap_or_else(|| "null".into())),
            ));
        }

        for e in events {
            s.events.push(LogEvent {
                timestamp: e.timestamp,
                message: e.message,
                stream: stream.to_string(),
            });
        }
        s.token += 1;
        Ok(s.token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_tokens_must_advance() {
        let logs = MemoryLogs::new();
        logs.create_log_stream("g", "s").await.unwrap();

        let event = || vec![InputLogEvent { timestamp: 1, message: "m".into() }];
        let t1 = logs.put_log_events("g", "s", event(), None).await.unwrap();
        let err = logs.put_log_events("g", "s", event(), None).await.unwrap_err();
        assert!(err.is_code("InvalidSequenceTokenException"));

        logs.put_log_events("g", "s", event(), Some(t1)).await.unwrap();
        assert_eq!(logs.events("g").len(), 2);
    }

    #[tokio::test]
    async fn filter_paginates_stream_by_stream() {
        let logs = MemoryLogs::new();
        logs.push("g", "a", 30, "three");
        logs.push("g", "b", 10, "one");
        logs.push("g", "a", 20, "two");
        logs.set_page_size(2);

        let first = logs
            .filter_log_events(FilterLogEventsRequest { group: "g".into(), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(first.events.iter().map(|e| e.timestamp).collect::<Vec<_>>(), vec![20, 30]);

        let second = logs
            .filter_log_events(FilterLogEventsRequest {
                group: "g".into(),
                next_token: first.next_token,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.events.iter().map(|e| e.timestamp).collect::<Vec<_>>(), vec![10]);
        assert!(second.next_token.is_none());
    }
}
