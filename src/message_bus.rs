//! Request/reply bus with correlation and no durability.
//!
//! A requester publishes a payload on a subject and waits for a single
//! correlated reply within a deadline; a responder polls the subject and
//! replies through the correlation handle. Nothing is retained: if no
//! responder is listening the request simply times out.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("request timed out")]
    Timeout,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("connection error: {0}")]
    Connection(String),
}

/// An inbound request taken off a subject, carrying the correlation
/// handle the reply must be sent through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusRequest {
    pub id: Uuid,
    pub subject: String,
    pub payload: Value,
    pub reply_to: String,
}

#[async_trait]
pub trait RequestBus: Send + Sync {
    /// Publishes a request and awaits its reply within `timeout`.
    async fn request(
        &self,
        subject: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BusError>;
    /// Takes the next pending request on a subject, blocking briefly.
    async fn next_request(&self, subject: &str) -> Result<Option<BusRequest>, BusError>;
    /// Sends the reply for a previously taken request.
    async fn reply(&self, request: &BusRequest, payload: Value) -> Result<(), BusError>;
}

type SubjectChannel = (
    mpsc::UnboundedSender<BusRequest>,
    Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<BusRequest>>>,
);

/// In-process bus built on channels; used by tests and single-node runs.
pub struct InMemoryBus {
    subjects: Mutex<HashMap<String, SubjectChannel>>,
    pending: DashMap<String, oneshot::Sender<Value>>,
    poll_timeout: Duration,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            subjects: Mutex::new(HashMap::new()),
            pending: DashMap::new(),
            poll_timeout: Duration::from_millis(100),
        }
    }

    fn channel(&self, subject: &str) -> SubjectChannel {
        let mut subjects = self.subjects.lock().unwrap();
        subjects
            .entry(subject.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                (tx, Arc::new(tokio::sync::Mutex::new(rx)))
            })
            .clone()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestBus for InMemoryBus {
    async fn request(
        &self,
        subject: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        let reply_to = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(reply_to.clone(), reply_tx);

        let request = BusRequest {
            id: Uuid::new_v4(),
            subject: subject.to_string(),
            payload,
            reply_to: reply_to.clone(),
        };
        let (tx, _) = self.channel(subject);
        if tx.send(request).is_err() {
            self.pending.remove(&reply_to);
            return Err(BusError::Connection("subject channel closed".into()));
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                self.pending.remove(&reply_to);
                Err(BusError::Connection("responder dropped the reply".into()))
            }
            Err(_) => {
                self.pending.remove(&reply_to);
                Err(BusError::Timeout)
            }
        }
    }

    async fn next_request(&self, subject: &str) -> Result<Option<BusRequest>, BusError> {
        let (_, rx) = self.channel(subject);
        let mut rx = rx.lock().await;
        match tokio::time::timeout(self.poll_timeout, rx.recv()).await {
            Ok(Some(request)) => Ok(Some(request)),
            Ok(None) => Err(BusError::Connection("subject channel closed".into())),
            Err(_) => Ok(None),
        }
    }

    async fn reply(&self, request: &BusRequest, payload: Value) -> Result<(), BusError> {
        match self.pending.remove(&request.reply_to) {
            Some((_, tx)) => tx
                .send(payload)
                .map_err(|_| BusError::Connection("requester gone".into())),
            // Requester already timed out; the reply is dropped, which is
            // exactly the no-durability contract.
            None => Ok(()),
        }
    }
}

/// Redis-list-backed bus: requests queue on `{ns}:subject:{s}`, replies
/// travel through a per-request reply list the requester blocks on.
#[derive(Debug)]
pub struct RedisBus {
    client: Arc<redis::Client>,
    namespace: String,
    poll_timeout: Duration,
}

impl RedisBus {
    const DEFAULT_NAMESPACE: &'static str = "payflow:bus";
    const REPLY_TTL_SECS: i64 = 30;

    pub fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            namespace: Self::DEFAULT_NAMESPACE.to_string(),
            poll_timeout: Duration::from_secs(1),
        })
    }

    fn subject_key(&self, subject: &str) -> String {
        format!("{}:subject:{}", self.namespace, subject)
    }

    fn reply_key(&self, id: &Uuid) -> String {
        format!("{}:reply:{}", self.namespace, id)
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, BusError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))
    }
}

#[async_trait]
impl RequestBus for RedisBus {
    async fn request(
        &self,
        subject: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        let id = Uuid::new_v4();
        let request = BusRequest {
            id,
            subject: subject.to_string(),
            payload,
            reply_to: self.reply_key(&id),
        };
        let encoded =
            serde_json::to_string(&request).map_err(|e| BusError::Serialization(e.to_string()))?;

        let mut conn = self.conn().await?;
        conn.lpush::<_, _, ()>(self.subject_key(subject), &encoded)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let raw: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&request.reply_to)
            .arg(timeout.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        match raw {
            Some((_, reply)) => {
                serde_json::from_str(&reply).map_err(|e| BusError::Serialization(e.to_string()))
            }
            None => Err(BusError::Timeout),
        }
    }

    async fn next_request(&self, subject: &str) -> Result<Option<BusRequest>, BusError> {
        let mut conn = self.conn().await?;
        let raw: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(self.subject_key(subject))
            .arg(self.poll_timeout.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        match raw {
            Some((_, encoded)) => serde_json::from_str(&encoded)
                .map(Some)
                .map_err(|e| BusError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn reply(&self, request: &BusRequest, payload: Value) -> Result<(), BusError> {
        let encoded =
            serde_json::to_string(&payload).map_err(|e| BusError::Serialization(e.to_string()))?;
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(&request.reply_to)
            .arg(&encoded)
            .cmd("EXPIRE")
            .arg(&request.reply_to)
            .arg(Self::REPLY_TTL_SECS)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn request_reply_round_trip() {
        let bus = Arc::new(InMemoryBus::new());

        let responder = bus.clone();
        let handle = tokio::spawn(async move {
            loop {
                if let Ok(Some(request)) = responder.next_request("echo").await {
                    let payload = request.payload.clone();
                    responder
                        .reply(&request, json!({ "echoed": payload }))
                        .await
                        .unwrap();
                    break;
                }
            }
        });

        let reply = bus
            .request("echo", json!({ "n": 7 }), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply["echoed"]["n"], 7);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn request_times_out_without_responder() {
        let bus = InMemoryBus::new();
        let err = bus
            .request("nobody.home", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout));
    }

    #[tokio::test]
    async fn late_reply_after_timeout_is_dropped() {
        let bus = Arc::new(InMemoryBus::new());

        let requester = bus.clone();
        let request_handle = tokio::spawn(async move {
            requester
                .request("slow", json!({}), Duration::from_millis(30))
                .await
        });

        let request = loop {
            if let Ok(Some(r)) = bus.next_request("slow").await {
                break r;
            }
        };
        assert!(matches!(
            request_handle.await.unwrap(),
            Err(BusError::Timeout)
        ));

        // The requester is gone; replying is a quiet no-op.
        bus.reply(&request, json!({ "too": "late" })).await.unwrap();
    }
}
