//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! - **Topic** → one stream key; each entry carries the fields `key` and `value`
//! - **Consumer groups** → `XGROUP CREATE ... MKSTREAM` (idempotent)
//! - **Consume** → after (re)subscription the consumer first re-reads its own
//!   pending entries (`XREADGROUP ... 0`), then new ones (`>` with `BLOCK`)
//! - **Commit** → `XACK`
//!
//! Pending entries whose payload was trimmed from the stream are acknowledged
//! and dropped with a warning.
//!
//! Consumer names are stable per process (the worker name), so entries left
//! pending by a crashed process are picked up again by its successor.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use flowbridge_messaging::{BrokerConsumer, BrokerError, BrokerMessage, DeliveryReport, MessageBroker, MessagePosition};

/// Entries fetched per XREADGROUP call.
const READ_BATCH: usize = 10;

#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    producer: Arc<Mutex<Option<MultiplexedConnection>>>,
    consumer_name: String,
    publish_retries: u32,
}

impl RedisStreamsBroker {
    /// `redis_url` e.g. `redis://localhost:6379`.
    pub fn new(
        redis_url: impl AsRef<str>,
        consumer_name: impl Into<String>,
        publish_retries: u32,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            producer: Arc::new(Mutex::new(None)),
            consumer_name: consumer_name.into(),
            publish_retries,
        })
    }

    async fn connect(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    async fn producer_connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        let mut cached = self.producer.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.connect().await?;
        *cached = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_producer(&self) {
        self.producer.lock().await.take();
    }

    async fn xadd(&self, topic: &str, key: &str, value: &str) -> Result<String, BrokerError> {
        let mut conn = self.producer_connection().await?;
        redis::cmd("XADD")
            .arg(topic)
            .arg("*")
            .arg("key")
            .arg(key)
            .arg("value")
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(format!("XADD failed: {e}")))
    }

    /// Create the consumer group if it does not exist yet.
    pub async fn ensure_consumer_group(&self, topic: &str, group: &str) -> Result<(), BrokerError> {
        let mut conn = self.connect().await?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BrokerError::ConsumerGroup(e.to_string())),
        }
    }
}

#[async_trait]
impl MessageBroker for RedisStreamsBroker {
    #[instrument(skip(self, value), fields(topic = %topic, key = %key), err)]
    async fn produce(&self, topic: &str, key: &str, value: &str) -> Result<DeliveryReport, BrokerError> {
        let mut attempt = 0;
        loop {
            match self.xadd(topic, key, value).await {
                Ok(id) => {
                    return Ok(DeliveryReport {
                        topic: topic.to_string(),
                        position: MessagePosition::StreamId(id),
                    });
                }
                Err(e) if attempt < self.publish_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "produce failed, retrying");
                    self.reset_producer().await;
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        if group.trim().is_empty() {
            return Err(BrokerError::ConsumerGroup("group name is blank".to_string()));
        }
        self.ensure_consumer_group(topic, group).await?;
        let conn = self.connect().await?;

        debug!(topic, group, consumer = %self.consumer_name, "subscribed to stream");
        Ok(Box::new(RedisStreamsConsumer {
            conn,
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: self.consumer_name.clone(),
            pending_drained: false,
            buffer: VecDeque::new(),
            closed: false,
        }))
    }
}

/// One consumer-group member with its own connection (XREADGROUP BLOCK would
/// otherwise stall every other user of a shared multiplexed connection).
struct RedisStreamsConsumer {
    conn: MultiplexedConnection,
    topic: String,
    group: String,
    consumer: String,
    pending_drained: bool,
    buffer: VecDeque<BrokerMessage>,
    closed: bool,
}

impl RedisStreamsConsumer {
    async fn read(&mut self, from: &str, block: Option<Duration>) -> Result<Vec<StreamEntry>, BrokerError> {
        loop {
            let mut cmd = redis::cmd("XREADGROUP");
            cmd.arg("GROUP")
                .arg(&self.group)
                .arg(&self.consumer)
                .arg("COUNT")
                .arg(READ_BATCH);
            if let Some(block) = block {
                cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
            }
            cmd.arg("STREAMS").arg(&self.topic).arg(from);

            let reply: redis::Value = cmd
                .query_async(&mut self.conn)
                .await
                .map_err(|e| BrokerError::Command(format!("XREADGROUP failed: {e}")))?;
            let batch = parse_read_reply(reply, &self.topic)?;

            if batch.trimmed.is_empty() {
                return Ok(batch.entries);
            }
            warn!(
                topic = %self.topic,
                group = %self.group,
                count = batch.trimmed.len(),
                "dropping pending entries trimmed from the stream"
            );
            self.ack(&batch.trimmed).await?;
            if !batch.entries.is_empty() {
                return Ok(batch.entries);
            }
        }
    }

    async fn ack(&mut self, ids: &[String]) -> Result<(), BrokerError> {
        let _: u64 = redis::cmd("XACK")
            .arg(&self.topic)
            .arg(&self.group)
            .arg(ids)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| BrokerError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }

    /// Delivery counts of this consumer's pending entries.
    async fn pending_counts(&mut self) -> HashMap<String, u32> {
        let reply: redis::RedisResult<Vec<(String, String, u64, u64)>> = redis::cmd("XPENDING")
            .arg(&self.topic)
            .arg(&self.group)
            .arg("-")
            .arg("+")
            .arg(READ_BATCH)
            .arg(&self.consumer)
            .query_async(&mut self.conn)
            .await;

        reply
            .map(|entries| {
                entries
                    .into_iter()
                    .map(|(id, _, _, count)| (id, u32::try_from(count).unwrap_or(u32::MAX)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn to_message(&self, entry: StreamEntry, delivery_count: u32) -> BrokerMessage {
        BrokerMessage {
            topic: self.topic.clone(),
            key: entry.fields.get("key").cloned(),
            value: entry.fields.get("value").cloned().unwrap_or_default(),
            position: MessagePosition::StreamId(entry.id),
            delivery_count,
        }
    }
}

#[async_trait]
impl BrokerConsumer for RedisStreamsConsumer {
    async fn consume(&mut self, timeout: Duration) -> Result<Option<BrokerMessage>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        if let Some(msg) = self.buffer.pop_front() {
            return Ok(Some(msg));
        }

        if !self.pending_drained {
            let pending = self.read("0", None).await?;
            if pending.is_empty() {
                self.pending_drained = true;
            } else {
                let counts = self.pending_counts().await;
                for entry in pending {
                    let count = counts.get(&entry.id).copied().unwrap_or(2);
                    let msg = self.to_message(entry, count);
                    self.buffer.push_back(msg);
                }
                return Ok(self.buffer.pop_front());
            }
        }

        for entry in self.read(">", Some(timeout)).await? {
            let msg = self.to_message(entry, 1);
            self.buffer.push_back(msg);
        }
        Ok(self.buffer.pop_front())
    }

    async fn commit(&mut self, message: &BrokerMessage) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let MessagePosition::StreamId(id) = &message.position else {
            return Err(BrokerError::Command(format!(
                "cannot acknowledge foreign position {}",
                message.position
            )));
        };

        self.ack(std::slice::from_ref(id)).await
    }

    async fn close(&mut self) {
        // Buffered entries stay in the PEL and come back on the next subscribe.
        self.buffer.clear();
        self.closed = true;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamEntry {
    id: String,
    fields: HashMap<String, String>,
}

/// Entries of one XREADGROUP reply, plus the ids of pending entries whose
/// payload is gone (nil fields).
#[derive(Debug, Default)]
struct ReadBatch {
    entries: Vec<StreamEntry>,
    trimmed: Vec<String>,
}

/// Parse an XREADGROUP reply: `[[stream, [[id, [f1, v1, ...]], ...]], ...]`.
///
/// A nil reply (BLOCK timed out) is an empty batch.
fn parse_read_reply(reply: redis::Value, stream: &str) -> Result<ReadBatch, BrokerError> {
    let streams = match reply {
        redis::Value::Nil => return Ok(ReadBatch::default()),
        redis::Value::Bulk(streams) => streams,
        other => return Err(BrokerError::Command(format!("unexpected XREADGROUP reply: {other:?}"))),
    };

    let mut batch = ReadBatch::default();
    for item in streams {
        let redis::Value::Bulk(pair) = item else {
            continue;
        };
        let [redis::Value::Data(name), redis::Value::Bulk(raw_entries)] = pair.as_slice() else {
            continue;
        };
        if String::from_utf8_lossy(name) != stream {
            continue;
        }
        for raw in raw_entries {
            match parse_entry(raw) {
                Some(ParsedEntry::Live(entry)) => batch.entries.push(entry),
                Some(ParsedEntry::Trimmed(id)) => batch.trimmed.push(id),
                None => {}
            }
        }
    }
    Ok(batch)
}

enum ParsedEntry {
    Live(StreamEntry),
    Trimmed(String),
}

fn parse_entry(raw: &redis::Value) -> Option<ParsedEntry> {
    let redis::Value::Bulk(parts) = raw else {
        return None;
    };
    let (id, raw_fields) = match parts.as_slice() {
        [redis::Value::Data(id), redis::Value::Bulk(raw_fields)] => (id, raw_fields),
        [redis::Value::Data(id), redis::Value::Nil] => {
            return Some(ParsedEntry::Trimmed(String::from_utf8_lossy(id).into_owned()));
        }
        _ => return None,
    };

    let fields = raw_fields
        .chunks(2)
        .filter_map(|chunk| match chunk {
            [redis::Value::Data(k), redis::Value::Data(v)] => Some((
                String::from_utf8_lossy(k).into_owned(),
                String::from_utf8_lossy(v).into_owned(),
            )),
            _ => None,
        })
        .collect();

    Some(ParsedEntry::Live(StreamEntry {
        id: String::from_utf8_lossy(id).into_owned(),
        fields,
    }))
}

#[cfg(test)]
mod tests {
    use redis::Value;

    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    fn entry(id: &str, fields: &[(&str, &str)]) -> Value {
        let flat = fields.iter().flat_map(|(k, v)| [data(k), data(v)]).collect();
        Value::Bulk(vec![data(id), Value::Bulk(flat)])
    }

    #[test]
    fn nil_reply_is_an_empty_batch() {
        let batch = parse_read_reply(Value::Nil, "t").unwrap();
        assert!(batch.entries.is_empty());
        assert!(batch.trimmed.is_empty());
    }

    #[test]
    fn entries_are_parsed_in_order() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("bridge.responses"),
            Value::Bulk(vec![
                entry("1-0", &[("key", "r1"), ("value", "{\"requestId\":\"r1\"}")]),
                entry("2-0", &[("key", "r2"), ("value", "{}")]),
            ]),
        ])]);

        let entries = parse_read_reply(reply, "bridge.responses").unwrap().entries;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "1-0");
        assert_eq!(entries[0].fields["key"], "r1");
        assert_eq!(entries[1].fields["value"], "{}");
    }

    #[test]
    fn trimmed_entries_are_reported_and_other_streams_skipped() {
        let reply = Value::Bulk(vec![
            Value::Bulk(vec![
                data("t"),
                Value::Bulk(vec![Value::Bulk(vec![data("1-0"), Value::Nil]), entry("2-0", &[("value", "v")])]),
            ]),
            Value::Bulk(vec![data("other"), Value::Bulk(vec![entry("9-0", &[("value", "x")])])]),
        ]);

        let batch = parse_read_reply(reply, "t").unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].id, "2-0");
        assert_eq!(batch.trimmed, vec!["1-0".to_string()]);
    }

    #[test]
    fn unexpected_reply_shape_is_an_error() {
        assert!(parse_read_reply(Value::Int(3), "t").is_err());
    }

    #[test]
    fn invalid_url_is_a_connection_error() {
        assert!(matches!(
            RedisStreamsBroker::new("not a url", "c", 0),
            Err(BrokerError::Connection(_))
        ));
    }
}
