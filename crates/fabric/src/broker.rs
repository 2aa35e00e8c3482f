use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{FabricError, Notification};

/// Messages awaiting delivery: `(queue, seq) → serialized StoredMessage`.
const MESSAGES_TABLE: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("messages");
/// Declared queues: `queue → next sequence number`.
const QUEUES_TABLE: TableDefinition<&str, u64> = TableDefinition::new("queues");
/// Dead letters: `(queue, seq) → raw body`.
const DEAD_LETTER_TABLE: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("dead_letters");

/// A notification is dropped once its retry count reaches this ceiling.
pub const MAX_RETRIES: u32 = 3;

const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_BACKOFF_BASE: Duration = Duration::from_secs(5);
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Derive an agent's inbound queue name.
pub fn queue_name(agent_name: &str) -> String {
    format!("{agent_name}_queue")
}

/// On-disk envelope. The retry count lives here so it survives requeues.
#[derive(Debug, Serialize, Deserialize)]
struct StoredMessage {
    retry_count: u32,
    body: String,
}

/// A delivered notification, pending terminal disposition.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub retry_count: u32,
    pub notification: Notification,
}

#[derive(Debug, Clone)]
struct Lease {
    queue: String,
    seq: u64,
}

/// Durable queue broker.
///
/// One broker instance is shared between the agent loop and its tools; every
/// write commits before returning, so an acknowledged message never comes
/// back and an unacknowledged one always does. Messages handed out by
/// [`Broker::drain`] are leased in memory and excluded from redelivery until
/// they are acked or nacked (or the process restarts, which releases every
/// lease; at-least-once, not exactly-once).
pub struct Broker {
    db: Database,
    path: PathBuf,
    next_tag: AtomicU64,
    leases: Mutex<HashMap<u64, Lease>>,
    in_flight: Mutex<HashSet<(String, u64)>>,
}

impl Broker {
    /// Open the broker store, retrying with exponential backoff (base 5 s,
    /// cap 60 s, 10 attempts) before giving up with `TransportUnavailable`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, FabricError> {
        Self::connect_with(path, CONNECT_ATTEMPTS, CONNECT_BACKOFF_BASE).await
    }

    /// Backoff-parameterized variant used by tests.
    pub async fn connect_with(
        path: impl AsRef<Path>,
        attempts: u32,
        backoff_base: Duration,
    ) -> Result<Self, FabricError> {
        let path = path.as_ref().to_path_buf();
        let mut delay = backoff_base;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match Self::open(&path) {
                Ok(broker) => {
                    info!(path = %path.display(), attempt, "broker store opened");
                    return Ok(broker);
                }
                Err(err) => {
                    warn!(attempt, attempts, error = %err, "broker open failed");
                    last_error = err;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(CONNECT_BACKOFF_CAP);
            }
        }

        Err(FabricError::TransportUnavailable(last_error))
    }

    fn open(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let db = Database::create(path).map_err(|e| e.to_string())?;
        {
            let tx = db.begin_write().map_err(|e| e.to_string())?;
            tx.open_table(MESSAGES_TABLE).map_err(|e| e.to_string())?;
            tx.open_table(QUEUES_TABLE).map_err(|e| e.to_string())?;
            tx.open_table(DEAD_LETTER_TABLE).map_err(|e| e.to_string())?;
            tx.commit().map_err(|e| e.to_string())?;
        }
        Ok(Self {
            db,
            path: path.to_path_buf(),
            next_tag: AtomicU64::new(1),
            leases: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Declare a queue. Idempotent; also called lazily by `publish`.
    pub fn declare_queue(&self, queue: &str) -> Result<(), FabricError> {
        let tx = self.db.begin_write().map_err(storage)?;
        {
            let mut queues = tx.open_table(QUEUES_TABLE).map_err(storage)?;
            if queues.get(queue).map_err(storage)?.is_none() {
                queues.insert(queue, 0u64).map_err(storage)?;
                debug!(queue, "queue declared");
            }
        }
        tx.commit().map_err(storage)?;
        Ok(())
    }

    /// Durable publish. The queue is declared if absent; the notification's
    /// recipient must own the target queue.
    pub fn publish(&self, queue: &str, notification: &Notification) -> Result<(), FabricError> {
        if queue_name(&notification.recipient_agent_id) != queue {
            return Err(FabricError::RecipientMismatch {
                recipient: notification.recipient_agent_id.clone(),
                queue: queue.to_string(),
            });
        }
        let body = serde_json::to_string(notification)
            .map_err(|e| FabricError::Storage(e.to_string()))?;
        self.publish_raw(queue, &body, 0)
    }

    /// Publish a raw body with an explicit retry count. Used internally for
    /// requeues and by tests to simulate foreign producers.
    pub fn publish_raw(&self, queue: &str, body: &str, retry_count: u32) -> Result<(), FabricError> {
        let stored = StoredMessage {
            retry_count,
            body: body.to_string(),
        };
        let bytes = serde_json::to_vec(&stored).map_err(|e| FabricError::Storage(e.to_string()))?;

        let tx = self.db.begin_write().map_err(storage)?;
        {
            let mut queues = tx.open_table(QUEUES_TABLE).map_err(storage)?;
            let seq = queues.get(queue).map_err(storage)?.map(|v| v.value()).unwrap_or(0);
            queues.insert(queue, seq + 1).map_err(storage)?;

            let mut messages = tx.open_table(MESSAGES_TABLE).map_err(storage)?;
            messages.insert((queue, seq), bytes.as_slice()).map_err(storage)?;
        }
        tx.commit().map_err(storage)?;
        Ok(())
    }

    /// Non-blocking pop of everything currently deliverable on `queue`.
    ///
    /// Each returned message carries a fresh delivery tag and its persisted
    /// retry count, and is leased until acked or nacked. Malformed bodies go
    /// to the dead-letter table and are omitted.
    pub fn drain(&self, queue: &str) -> Result<Vec<Delivery>, FabricError> {
        let mut deliveries = Vec::new();
        let mut malformed: Vec<u64> = Vec::new();

        {
            let tx = self.db.begin_read().map_err(storage)?;
            let messages = tx.open_table(MESSAGES_TABLE).map_err(storage)?;
            let in_flight = self.in_flight.lock();

            let range = messages
                .range((queue, 0u64)..=(queue, u64::MAX))
                .map_err(storage)?;
            for entry in range {
                let (key, value) = entry.map_err(storage)?;
                let (_, seq) = key.value();
                if in_flight.contains(&(queue.to_string(), seq)) {
                    continue;
                }

                let stored: StoredMessage = match serde_json::from_slice(value.value()) {
                    Ok(s) => s,
                    Err(_) => {
                        malformed.push(seq);
                        continue;
                    }
                };
                match serde_json::from_str::<Notification>(&stored.body) {
                    Ok(notification) => {
                        deliveries.push((seq, stored.retry_count, notification));
                    }
                    Err(err) => {
                        warn!(queue, seq, error = %err, "malformed notification body, dead-lettering");
                        malformed.push(seq);
                    }
                }
            }
        }

        if !malformed.is_empty() {
            self.dead_letter_batch(queue, &malformed)?;
        }

        let mut out = Vec::with_capacity(deliveries.len());
        let mut leases = self.leases.lock();
        let mut in_flight = self.in_flight.lock();
        for (seq, retry_count, notification) in deliveries {
            let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
            leases.insert(
                tag,
                Lease {
                    queue: queue.to_string(),
                    seq,
                },
            );
            in_flight.insert((queue.to_string(), seq));
            out.push(Delivery {
                tag,
                retry_count,
                notification,
            });
        }
        Ok(out)
    }

    /// Acknowledge: the message is gone for good.
    pub fn ack(&self, tag: u64) -> Result<(), FabricError> {
        let lease = self.take_lease(tag)?;
        let tx = self.db.begin_write().map_err(storage)?;
        {
            let mut messages = tx.open_table(MESSAGES_TABLE).map_err(storage)?;
            messages
                .remove((lease.queue.as_str(), lease.seq))
                .map_err(storage)?;
        }
        tx.commit().map_err(storage)?;
        debug!(tag, queue = %lease.queue, "acked");
        Ok(())
    }

    /// Negative acknowledgement. With `requeue` the retry count is bumped and
    /// the message becomes deliverable again; without it the message is
    /// dead-lettered.
    pub fn nack(&self, tag: u64, requeue: bool) -> Result<(), FabricError> {
        let lease = self.take_lease(tag)?;
        let tx = self.db.begin_write().map_err(storage)?;
        let mut found = false;
        {
            let mut messages = tx.open_table(MESSAGES_TABLE).map_err(storage)?;
            let key = (lease.queue.as_str(), lease.seq);
            let existing = messages
                .get(key)
                .map_err(storage)?
                .map(|v| v.value().to_vec());

            if let Some(bytes) = existing {
                found = true;
                if requeue {
                    let mut stored: StoredMessage = serde_json::from_slice(&bytes)
                        .map_err(|e| FabricError::Storage(e.to_string()))?;
                    stored.retry_count += 1;
                    let updated = serde_json::to_vec(&stored)
                        .map_err(|e| FabricError::Storage(e.to_string()))?;
                    messages.insert(key, updated.as_slice()).map_err(storage)?;
                } else {
                    messages.remove(key).map_err(storage)?;
                    let mut dead = tx.open_table(DEAD_LETTER_TABLE).map_err(storage)?;
                    dead.insert(key, bytes.as_slice()).map_err(storage)?;
                }
            }
        }
        tx.commit().map_err(storage)?;
        if !found {
            return Err(FabricError::UnknownDeliveryTag(tag));
        }
        debug!(tag, requeue, queue = %lease.queue, "nacked");
        Ok(())
    }

    /// Number of deliverable (non-leased) messages on `queue`.
    pub fn pending_count(&self, queue: &str) -> Result<usize, FabricError> {
        let tx = self.db.begin_read().map_err(storage)?;
        let messages = tx.open_table(MESSAGES_TABLE).map_err(storage)?;
        let in_flight = self.in_flight.lock();
        let mut count = 0;
        let range = messages
            .range((queue, 0u64)..=(queue, u64::MAX))
            .map_err(storage)?;
        for entry in range {
            let (key, _) = entry.map_err(storage)?;
            let (_, seq) = key.value();
            if !in_flight.contains(&(queue.to_string(), seq)) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Number of dead-lettered messages on `queue`.
    pub fn dead_letter_count(&self, queue: &str) -> Result<usize, FabricError> {
        let tx = self.db.begin_read().map_err(storage)?;
        let dead = tx.open_table(DEAD_LETTER_TABLE).map_err(storage)?;
        let range = dead
            .range((queue, 0u64)..=(queue, u64::MAX))
            .map_err(storage)?;
        let mut count = 0;
        for entry in range {
            entry.map_err(storage)?;
            count += 1;
        }
        Ok(count)
    }

    fn take_lease(&self, tag: u64) -> Result<Lease, FabricError> {
        let lease = self
            .leases
            .lock()
            .remove(&tag)
            .ok_or(FabricError::UnknownDeliveryTag(tag))?;
        self.in_flight
            .lock()
            .remove(&(lease.queue.clone(), lease.seq));
        Ok(lease)
    }

    fn dead_letter_batch(&self, queue: &str, seqs: &[u64]) -> Result<(), FabricError> {
        let tx = self.db.begin_write().map_err(storage)?;
        {
            let mut messages = tx.open_table(MESSAGES_TABLE).map_err(storage)?;
            let mut dead = tx.open_table(DEAD_LETTER_TABLE).map_err(storage)?;
            for &seq in seqs {
                let key = (queue, seq);
                let bytes = messages
                    .get(key)
                    .map_err(storage)?
                    .map(|v| v.value().to_vec());
                if let Some(bytes) = bytes {
                    messages.remove(key).map_err(storage)?;
                    dead.insert(key, bytes.as_slice()).map_err(storage)?;
                }
            }
        }
        tx.commit().map_err(storage)?;
        Ok(())
    }
}

fn storage<E: std::fmt::Display>(err: E) -> FabricError {
    FabricError::Storage(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NotificationType;

    async fn test_broker() -> (Broker, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::connect_with(dir.path().join("q.redb"), 1, Duration::from_millis(1))
            .await
            .unwrap();
        (broker, dir)
    }

    fn user_message(agent: &str, content: &str) -> Notification {
        Notification::new(
            NotificationType::UserMessage,
            agent,
            "api_gateway",
            serde_json::json!({"content": content, "session_id": "s1"}),
        )
    }

    #[test]
    fn queue_name_is_agent_plus_suffix() {
        assert_eq!(queue_name("weather_agent"), "weather_agent_queue");
        assert_eq!(queue_name("primary_agent"), "primary_agent_queue");
    }

    #[tokio::test]
    async fn publish_then_drain_round_trip() {
        let (broker, _dir) = test_broker().await;
        let queue = queue_name("a_agent");
        broker.publish(&queue, &user_message("a_agent", "hi")).unwrap();

        let drained = broker.drain(&queue).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].retry_count, 0);
        assert_eq!(drained[0].notification.payload["content"], "hi");
    }

    #[tokio::test]
    async fn publish_rejects_recipient_queue_mismatch() {
        let (broker, _dir) = test_broker().await;
        let err = broker
            .publish("other_agent_queue", &user_message("a_agent", "hi"))
            .unwrap_err();
        assert!(matches!(err, FabricError::RecipientMismatch { .. }));
    }

    #[tokio::test]
    async fn drained_messages_are_leased_until_disposed() {
        let (broker, _dir) = test_broker().await;
        let queue = queue_name("a_agent");
        broker.publish(&queue, &user_message("a_agent", "hi")).unwrap();

        let first = broker.drain(&queue).unwrap();
        assert_eq!(first.len(), 1);
        // Same message must not be handed out twice while leased.
        assert!(broker.drain(&queue).unwrap().is_empty());

        broker.nack(first[0].tag, true).unwrap();
        let second = broker.drain(&queue).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].retry_count, 1);
    }

    #[tokio::test]
    async fn ack_removes_permanently() {
        let (broker, _dir) = test_broker().await;
        let queue = queue_name("a_agent");
        broker.publish(&queue, &user_message("a_agent", "hi")).unwrap();

        let drained = broker.drain(&queue).unwrap();
        broker.ack(drained[0].tag).unwrap();
        assert!(broker.drain(&queue).unwrap().is_empty());
        assert_eq!(broker.pending_count(&queue).unwrap(), 0);
    }

    #[tokio::test]
    async fn nack_without_requeue_dead_letters() {
        let (broker, _dir) = test_broker().await;
        let queue = queue_name("a_agent");
        broker.publish(&queue, &user_message("a_agent", "hi")).unwrap();

        let drained = broker.drain(&queue).unwrap();
        broker.nack(drained[0].tag, false).unwrap();
        assert!(broker.drain(&queue).unwrap().is_empty());
        assert_eq!(broker.dead_letter_count(&queue).unwrap(), 1);
    }

    #[tokio::test]
    async fn malformed_body_is_dead_lettered_on_drain() {
        let (broker, _dir) = test_broker().await;
        let queue = queue_name("a_agent");
        broker.publish_raw(&queue, "{not json", 0).unwrap();
        broker.publish(&queue, &user_message("a_agent", "ok")).unwrap();

        let drained = broker.drain(&queue).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].notification.payload["content"], "ok");
        assert_eq!(broker.dead_letter_count(&queue).unwrap(), 1);
    }

    #[tokio::test]
    async fn retry_count_survives_multiple_requeues() {
        let (broker, _dir) = test_broker().await;
        let queue = queue_name("a_agent");
        broker.publish(&queue, &user_message("a_agent", "hi")).unwrap();

        for expected in 0..MAX_RETRIES {
            let drained = broker.drain(&queue).unwrap();
            assert_eq!(drained[0].retry_count, expected);
            broker.nack(drained[0].tag, true).unwrap();
        }
        let drained = broker.drain(&queue).unwrap();
        assert_eq!(drained[0].retry_count, MAX_RETRIES);
    }

    #[tokio::test]
    async fn unknown_tag_is_an_error() {
        let (broker, _dir) = test_broker().await;
        assert!(matches!(
            broker.ack(999).unwrap_err(),
            FabricError::UnknownDeliveryTag(999)
        ));
    }
}
