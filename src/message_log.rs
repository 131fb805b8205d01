//! Partitioned, at-least-once event log.
//!
//! Producers publish records keyed by payment id; per-key order is
//! preserved. Consumers poll, then ack (delivery done) or nack (requeue
//! for redelivery at the front, keeping order). Unacked records survive a
//! consumer crash: the Redis backend parks in-flight deliveries on a
//! processing list and moves them back on startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("connection error: {0}")]
    Connection(String),
}

/// A single record on a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: Uuid,
    pub topic: String,
    pub partition_key: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub delivery_count: u32,
}

impl LogRecord {
    pub fn new(topic: &str, partition_key: &str, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            partition_key: partition_key.to_string(),
            payload,
            timestamp: Utc::now(),
            delivery_count: 0,
        }
    }
}

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn publish(&self, topic: &str, partition_key: &str, payload: Value)
        -> Result<(), LogError>;
    /// Takes the next record off a topic, if any. The record stays
    /// in-flight until acked or nacked.
    async fn poll(&self, topic: &str) -> Result<Option<LogRecord>, LogError>;
    async fn ack(&self, record: &LogRecord) -> Result<(), LogError>;
    /// Returns the record to the head of its topic for redelivery.
    async fn nack(&self, record: &LogRecord) -> Result<(), LogError>;
}

/// In-memory log for tests and single-node runs.
///
/// Keeps the full publish history per topic so a topic can be replayed
/// from the beginning, the way a retained log allows.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    queues: Mutex<HashMap<String, VecDeque<LogRecord>>>,
    inflight: Mutex<HashMap<Uuid, LogRecord>>,
    history: Mutex<HashMap<String, Vec<LogRecord>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record ever published to a topic, in publish order.
    pub fn history(&self, topic: &str) -> Vec<LogRecord> {
        self.history
            .lock()
            .unwrap()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of records waiting (not in-flight) on a topic.
    pub fn depth(&self, topic: &str) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(topic)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        payload: Value,
    ) -> Result<(), LogError> {
        let record = LogRecord::new(topic, partition_key, payload);
        self.history
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push(record.clone());
        self.queues
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push_back(record);
        Ok(())
    }

    async fn poll(&self, topic: &str) -> Result<Option<LogRecord>, LogError> {
        let popped = {
            let mut queues = self.queues.lock().unwrap();
            queues.get_mut(topic).and_then(|q| q.pop_front())
        };
        match popped {
            Some(mut record) => {
                record.delivery_count += 1;
                self.inflight
                    .lock()
                    .unwrap()
                    .insert(record.id, record.clone());
                Ok(Some(record))
            }
            None => {
                // Idle topic: back off briefly instead of spinning.
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(None)
            }
        }
    }

    async fn ack(&self, record: &LogRecord) -> Result<(), LogError> {
        self.inflight.lock().unwrap().remove(&record.id);
        Ok(())
    }

    async fn nack(&self, record: &LogRecord) -> Result<(), LogError> {
        if let Some(inflight) = self.inflight.lock().unwrap().remove(&record.id) {
            self.queues
                .lock()
                .unwrap()
                .entry(record.topic.clone())
                .or_default()
                .push_front(inflight);
        }
        Ok(())
    }
}

/// Redis-list-backed log for cross-process deployments.
///
/// Publish pushes to the left of `{ns}:topic:{t}`; poll moves the oldest
/// record onto `{ns}:processing:{t}` so a crashed consumer's deliveries
/// can be recovered on the next startup.
#[derive(Debug)]
pub struct RedisEventLog {
    client: Arc<redis::Client>,
    namespace: String,
    block_timeout: Duration,
    inflight: Mutex<HashMap<Uuid, String>>,
}

impl RedisEventLog {
    const DEFAULT_NAMESPACE: &'static str = "payflow:log";

    pub async fn connect(url: &str) -> Result<Self, LogError> {
        Self::connect_with_namespace(url, Self::DEFAULT_NAMESPACE).await
    }

    pub async fn connect_with_namespace(url: &str, namespace: &str) -> Result<Self, LogError> {
        let client = redis::Client::open(url).map_err(|e| LogError::Connection(e.to_string()))?;
        let log = Self {
            client: Arc::new(client),
            namespace: namespace.to_string(),
            block_timeout: Duration::from_secs(1),
            inflight: Mutex::new(HashMap::new()),
        };
        log.recover_stalled().await?;
        Ok(log)
    }

    fn topic_key(&self, topic: &str) -> String {
        format!("{}:topic:{}", self.namespace, topic)
    }

    fn processing_key(&self, topic: &str) -> String {
        format!("{}:processing:{}", self.namespace, topic)
    }

    fn topics_key(&self) -> String {
        format!("{}:topics", self.namespace)
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, LogError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LogError::Connection(e.to_string()))
    }

    /// Moves records a dead consumer left on processing lists back onto
    /// their topics.
    async fn recover_stalled(&self) -> Result<(), LogError> {
        let mut conn = self.conn().await?;
        let topics: Vec<String> = conn
            .smembers(self.topics_key())
            .await
            .map_err(|e| LogError::Connection(e.to_string()))?;

        for topic in topics {
            loop {
                let moved: Option<String> = redis::cmd("RPOPLPUSH")
                    .arg(self.processing_key(&topic))
                    .arg(self.topic_key(&topic))
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| LogError::Connection(e.to_string()))?;
                if moved.is_none() {
                    break;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        payload: Value,
    ) -> Result<(), LogError> {
        let record = LogRecord::new(topic, partition_key, payload);
        let encoded =
            serde_json::to_string(&record).map_err(|e| LogError::Serialization(e.to_string()))?;
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(self.topic_key(topic))
            .arg(&encoded)
            .cmd("SADD")
            .arg(self.topics_key())
            .arg(topic)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| LogError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn poll(&self, topic: &str) -> Result<Option<LogRecord>, LogError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(self.topic_key(topic))
            .arg(self.processing_key(topic))
            .arg(self.block_timeout.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| LogError::Connection(e.to_string()))?;

        match raw {
            Some(encoded) => {
                let mut record: LogRecord = serde_json::from_str(&encoded)
                    .map_err(|e| LogError::Serialization(e.to_string()))?;
                record.delivery_count += 1;
                self.inflight.lock().unwrap().insert(record.id, encoded);
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, record: &LogRecord) -> Result<(), LogError> {
        let encoded = self.inflight.lock().unwrap().remove(&record.id);
        if let Some(encoded) = encoded {
            let mut conn = self.conn().await?;
            redis::cmd("LREM")
                .arg(self.processing_key(&record.topic))
                .arg(1)
                .arg(&encoded)
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| LogError::Connection(e.to_string()))?;
        }
        Ok(())
    }

    async fn nack(&self, record: &LogRecord) -> Result<(), LogError> {
        let encoded = self.inflight.lock().unwrap().remove(&record.id);
        if let Some(encoded) = encoded {
            let mut conn = self.conn().await?;
            redis::pipe()
                .atomic()
                .cmd("LREM")
                .arg(self.processing_key(&record.topic))
                .arg(1)
                .arg(&encoded)
                .cmd("RPUSH")
                .arg(self.topic_key(&record.topic))
                .arg(&encoded)
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| LogError::Connection(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn preserves_publish_order_per_key() {
        let log = InMemoryEventLog::new();
        for seq in 0..5 {
            log.publish("t", "p-1", json!({ "seq": seq })).await.unwrap();
        }

        for expected in 0..5 {
            let record = log.poll("t").await.unwrap().expect("record");
            assert_eq!(record.payload["seq"], expected);
            log.ack(&record).await.unwrap();
        }
        assert!(log.poll("t").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nack_redelivers_at_the_front() {
        let log = InMemoryEventLog::new();
        log.publish("t", "p-1", json!({ "seq": 0 })).await.unwrap();
        log.publish("t", "p-1", json!({ "seq": 1 })).await.unwrap();

        let first = log.poll("t").await.unwrap().expect("record");
        assert_eq!(first.delivery_count, 1);
        log.nack(&first).await.unwrap();

        // Redelivered before the younger record, with the count bumped.
        let redelivered = log.poll("t").await.unwrap().expect("record");
        assert_eq!(redelivered.payload["seq"], 0);
        assert_eq!(redelivered.delivery_count, 2);
    }

    #[tokio::test]
    async fn ack_is_final() {
        let log = InMemoryEventLog::new();
        log.publish("t", "p-1", json!({})).await.unwrap();
        let record = log.poll("t").await.unwrap().expect("record");
        log.ack(&record).await.unwrap();
        // A nack after ack must not resurrect the record.
        log.nack(&record).await.unwrap();
        assert!(log.poll("t").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn history_retains_consumed_records() {
        let log = InMemoryEventLog::new();
        log.publish("t", "a", json!({ "seq": 0 })).await.unwrap();
        log.publish("t", "b", json!({ "seq": 1 })).await.unwrap();
        let record = log.poll("t").await.unwrap().expect("record");
        log.ack(&record).await.unwrap();

        assert_eq!(log.history("t").len(), 2);
        assert_eq!(log.depth("t"), 1);
    }
}
