//! Append + notify writer and cursor-replay reader for a run's event
//! stream.

use std::sync::Arc;

use skein_broker::{Broker, BrokerError};
use skein_domain::config::RESPONSE_LIST_TTL;
use skein_domain::event::{control, Event, StatusValue};
use skein_domain::stream::BoxStream;
use uuid::Uuid;

use crate::keys::{new_event_channel, response_list_key};

/// One item observed by a log subscriber.
#[derive(Debug, Clone)]
pub enum LogItem {
    /// An event at a list index. Indices are contiguous from 0; a
    /// reconnecting subscriber passes its last index + 1 as the cursor.
    Event { index: u64, event: Event },
    /// The stream ended with a terminal control token
    /// (`END_STREAM`, `ERROR` or `STOP`).
    End { token: String },
}

/// Handle to the per-run event log in the broker.
#[derive(Clone)]
pub struct EventLog {
    broker: Arc<dyn Broker>,
}

impl EventLog {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Append one event and notify subscribers. Returns the new list
    /// length. Publishing never blocks on absent subscribers.
    pub async fn append(&self, run_id: Uuid, event: &Event) -> Result<u64, BrokerError> {
        let json = serde_json::to_string(event)
            .map_err(|e| BrokerError::Command(format!("event encode: {e}")))?;
        let len = self.broker.rpush(&response_list_key(run_id), &json).await?;
        self.broker
            .publish(&new_event_channel(run_id), control::NEW_EVENT)
            .await?;
        Ok(len)
    }

    /// Publish a terminal control token on the notification channel.
    pub async fn publish_control(&self, run_id: Uuid, token: &str) -> Result<(), BrokerError> {
        self.broker.publish(&new_event_channel(run_id), token).await
    }

    /// Read everything from `cursor` (inclusive) to the end of the list.
    pub async fn read_from(&self, run_id: Uuid, cursor: u64) -> Result<Vec<Event>, BrokerError> {
        let raw = self
            .broker
            .lrange(&response_list_key(run_id), cursor as i64, -1)
            .await?;
        Ok(decode_events(run_id, &raw))
    }

    pub async fn len(&self, run_id: Uuid) -> Result<u64, BrokerError> {
        self.broker.llen(&response_list_key(run_id)).await
    }

    /// Arm (or re-arm) the retention TTL; called on terminal transition and
    /// periodically by the worker while the run is live.
    pub async fn extend_ttl(&self, run_id: Uuid) -> Result<(), BrokerError> {
        self.broker
            .expire(&response_list_key(run_id), RESPONSE_LIST_TTL)
            .await
    }

    /// Subscribe from a cursor: replay the backlog, then follow live
    /// appends until a terminal control token arrives.
    ///
    /// Delivery is at-least-once; the internal cursor dedupes, so every
    /// index is yielded exactly once per subscription. A cursor past the
    /// end of the list yields nothing until the next append.
    pub fn subscribe(&self, run_id: Uuid, cursor: u64) -> BoxStream<'static, LogItem> {
        let broker = Arc::clone(&self.broker);
        Box::pin(async_stream::stream! {
            let list_key = response_list_key(run_id);
            let channel = new_event_channel(run_id);
            let mut cursor = cursor;

            // Subscribe before the catch-up read so an append racing the
            // replay still produces a notification.
            let mut sub = match broker.subscribe(&channel).await {
                Ok(sub) => sub,
                Err(e) => {
                    tracing::warn!(%run_id, error = %e, "event log subscribe failed");
                    yield LogItem::End { token: control::ERROR.to_string() };
                    return;
                }
            };

            match broker.lrange(&list_key, cursor as i64, -1).await {
                Ok(raw) => {
                    let mut terminal: Option<StatusValue> = None;
                    for event in decode_events(run_id, &raw) {
                        if let Some(status) = event.terminal_status() {
                            terminal = Some(status);
                        }
                        yield LogItem::Event { index: cursor, event };
                        cursor += 1;
                    }
                    // The run ended before this subscriber attached; its
                    // control token was published to nobody. Close from
                    // the replayed terminal status instead of waiting.
                    if let Some(status) = terminal {
                        yield LogItem::End { token: token_for(status).to_string() };
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(%run_id, error = %e, "event log catch-up read failed");
                    yield LogItem::End { token: control::ERROR.to_string() };
                    return;
                }
            }

            loop {
                let Some(token) = sub.recv().await else {
                    yield LogItem::End { token: control::ERROR.to_string() };
                    return;
                };

                // Flush new entries for both data and terminal
                // notifications; the terminal event itself was appended
                // before its token was published.
                match broker.lrange(&list_key, cursor as i64, -1).await {
                    Ok(raw) => {
                        for event in decode_events(run_id, &raw) {
                            yield LogItem::Event { index: cursor, event };
                            cursor += 1;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%run_id, error = %e, "event log flush failed");
                        yield LogItem::End { token: control::ERROR.to_string() };
                        return;
                    }
                }

                if control::is_terminal(&token) {
                    yield LogItem::End { token };
                    return;
                }
            }
        })
    }
}

fn token_for(status: StatusValue) -> &'static str {
    match status {
        StatusValue::Completed => control::END_STREAM,
        StatusValue::Stopped => control::STOP,
        _ => control::ERROR,
    }
}

fn decode_events(run_id: Uuid, raw: &[String]) -> Vec<Event> {
    raw.iter()
        .filter_map(|line| match serde_json::from_str::<Event>(line) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(%run_id, error = %e, "dropping undecodable event log entry");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;
    use skein_broker::MemoryBroker;
    use skein_domain::event::StatusValue;

    fn log() -> (EventLog, Uuid) {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        (EventLog::new(broker), Uuid::new_v4())
    }

    #[tokio::test]
    async fn append_then_read_from_cursor() {
        let (log, run_id) = log();
        let tid = Uuid::new_v4();
        for i in 0..4 {
            log.append(run_id, &Event::assistant_chunk(tid, i, format!("c{i}")))
                .await
                .unwrap();
        }
        assert_eq!(log.len(run_id).await.unwrap(), 4);

        let tail = log.read_from(run_id, 2).await.unwrap();
        assert_eq!(tail.len(), 2);
    }

    #[tokio::test]
    async fn subscriber_replays_backlog_then_follows_live() {
        let (log, run_id) = log();
        let tid = Uuid::new_v4();

        for i in 0..3 {
            log.append(run_id, &Event::assistant_chunk(tid, i, "x"))
                .await
                .unwrap();
        }

        let mut stream = log.subscribe(run_id, 0);
        for expected in 0..3u64 {
            match stream.next().await.unwrap() {
                LogItem::Event { index, .. } => assert_eq!(index, expected),
                other => panic!("unexpected item: {other:?}"),
            }
        }

        // Live append arrives through the notification path.
        log.append(run_id, &Event::status(None, StatusValue::Completed))
            .await
            .unwrap();
        match stream.next().await.unwrap() {
            LogItem::Event { index, event } => {
                assert_eq!(index, 3);
                assert!(event.terminal_status().is_some());
            }
            other => panic!("unexpected item: {other:?}"),
        }

        log.publish_control(run_id, control::END_STREAM).await.unwrap();
        match stream.next().await.unwrap() {
            LogItem::End { token } => assert_eq!(token, control::END_STREAM),
            other => panic!("unexpected item: {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn late_subscriber_sees_full_history() {
        let (log, run_id) = log();
        let tid = Uuid::new_v4();
        for i in 0..5 {
            log.append(run_id, &Event::assistant_chunk(tid, i, "x"))
                .await
                .unwrap();
        }
        log.append(run_id, &Event::status(None, StatusValue::Completed))
            .await
            .unwrap();

        let mut stream = log.subscribe(run_id, 0);
        let mut indices = Vec::new();
        for _ in 0..6 {
            match stream.next().await.unwrap() {
                LogItem::Event { index, .. } => indices.push(index),
                other => panic!("unexpected item: {other:?}"),
            }
        }
        assert_eq!(indices, (0..6).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn cursor_past_end_yields_only_future_events() {
        let (log, run_id) = log();
        let tid = Uuid::new_v4();
        log.append(run_id, &Event::assistant_chunk(tid, 0, "a"))
            .await
            .unwrap();

        // Cursor beyond the current length: nothing replayed.
        let mut stream = log.subscribe(run_id, 5);
        tokio::time::timeout(Duration::from_millis(50), stream.next())
            .await
            .expect_err("no item should arrive yet");

        // Appends eventually reach the cursor.
        for i in 1..=5u64 {
            log.append(run_id, &Event::assistant_chunk(tid, i, "b"))
                .await
                .unwrap();
        }
        match stream.next().await.unwrap() {
            LogItem::Event { index, .. } => assert_eq!(index, 5),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resume_from_cursor_after_disconnect() {
        let (log, run_id) = log();
        let tid = Uuid::new_v4();
        for i in 0..10 {
            log.append(run_id, &Event::assistant_chunk(tid, i, "x"))
                .await
                .unwrap();
        }

        // First subscriber reads 10 and disconnects.
        {
            let mut stream = log.subscribe(run_id, 0);
            for _ in 0..10 {
                assert!(matches!(
                    stream.next().await.unwrap(),
                    LogItem::Event { .. }
                ));
            }
        }

        // 5 more appended while disconnected.
        for i in 10..15 {
            log.append(run_id, &Event::assistant_chunk(tid, i, "y"))
                .await
                .unwrap();
        }

        // Reconnect at cursor 10: sees 10..14 immediately, then live ones.
        let mut stream = log.subscribe(run_id, 10);
        for expected in 10..15u64 {
            match stream.next().await.unwrap() {
                LogItem::Event { index, .. } => assert_eq!(index, expected),
                other => panic!("unexpected item: {other:?}"),
            }
        }

        for i in 15..18 {
            log.append(run_id, &Event::assistant_chunk(tid, i, "z"))
                .await
                .unwrap();
        }
        for expected in 15..18u64 {
            match stream.next().await.unwrap() {
                LogItem::Event { index, .. } => assert_eq!(index, expected),
                other => panic!("unexpected item: {other:?}"),
            }
        }

        log.publish_control(run_id, control::STOP).await.unwrap();
        match stream.next().await.unwrap() {
            LogItem::End { token } => assert_eq!(token, control::STOP),
            other => panic!("unexpected item: {other:?}"),
        }
    }
}
