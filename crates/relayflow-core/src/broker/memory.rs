//! In-memory partitioned log broker.
//!
//! Same delivery semantics as the SQLite broker (keyed partitioning,
//! per-group committed offsets, monotonic commits) without durability. Used
//! as the test double for the relay and the executor, with switches for
//! simulating outages and partially written batches.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use relayflow_types::error::BrokerError;
use relayflow_types::event::StageEvent;
use tracing::debug;

use super::{
    Delivery, OutgoingMessage, PartitionOffsets, StageBroker, check_partition, partition_for,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    key: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct BrokerState {
    /// topic -> partition -> log
    logs: HashMap<String, Vec<Vec<StoredMessage>>>,
    /// (group, topic, partition) -> next offset
    committed: HashMap<(String, String, u32), u64>,
    /// When set, the next publish writes this many messages and then fails.
    fail_publish_after: Option<usize>,
}

/// Process-local `StageBroker`.
pub struct InMemoryBroker {
    partitions: u32,
    state: Mutex<BrokerState>,
    available: AtomicBool,
}

impl InMemoryBroker {
    /// Create a broker where every topic has `partitions` partitions.
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            state: Mutex::new(BrokerState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle simulated availability. While unavailable every operation
    /// fails with `BrokerError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next publish write only the first `written` messages of its
    /// batch and then fail.
    pub fn fail_next_publish_after(&self, written: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_publish_after = Some(written);
        }
    }

    /// Every message of `topic`, partition by partition, in offset order.
    pub fn messages(&self, topic: &str) -> Vec<Delivery> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let Some(log) = state.logs.get(topic) else {
            return Vec::new();
        };
        log.iter()
            .enumerate()
            .flat_map(|(partition, messages)| {
                messages.iter().enumerate().map(move |(offset, m)| Delivery {
                    topic: topic.to_string(),
                    partition: partition as u32,
                    offset: offset as u64,
                    key: m.key.clone(),
                    payload: m.payload.clone(),
                })
            })
            .collect()
    }

    /// Every decodable stage event of `topic`.
    pub fn stage_events(&self, topic: &str) -> Vec<StageEvent> {
        self.messages(topic)
            .iter()
            .filter_map(|d| StageEvent::from_bytes(&d.payload).ok())
            .collect()
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("in-memory broker offline".to_string()))
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BrokerState>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Unavailable("broker state lock poisoned".to_string()))
    }
}

impl StageBroker for InMemoryBroker {
    fn partition_count(&self, _topic: &str) -> u32 {
        self.partitions
    }

    async fn publish(&self, topic: &str, messages: Vec<OutgoingMessage>) -> Result<(), BrokerError> {
        self.check_available()?;
        let mut state = self.lock()?;
        let fail_after = state.fail_publish_after.take();
        let partitions = self.partitions;
        let log = state
            .logs
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions as usize]);

        for (written, message) in messages.into_iter().enumerate() {
            if fail_after == Some(written) {
                return Err(BrokerError::Publish(format!(
                    "simulated failure after {written} messages"
                )));
            }
            let partition = partition_for(&message.key, partitions) as usize;
            log[partition].push(StoredMessage {
                key: message.key,
                payload: message.payload,
            });
        }
        Ok(())
    }

    async fn fetch(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        max: u32,
    ) -> Result<Vec<Delivery>, BrokerError> {
        self.check_available()?;
        check_partition(topic, partition, self.partitions)?;
        let state = self.lock()?;
        let start = state
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
            .unwrap_or(0);

        let Some(log) = state.logs.get(topic) else {
            return Ok(Vec::new());
        };
        let deliveries = log[partition as usize]
            .iter()
            .enumerate()
            .skip(start as usize)
            .take(max as usize)
            .map(|(offset, m)| Delivery {
                topic: topic.to_string(),
                partition,
                offset: offset as u64,
                key: m.key.clone(),
                payload: m.payload.clone(),
            })
            .collect();
        Ok(deliveries)
    }

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        next_offset: u64,
    ) -> Result<(), BrokerError> {
        self.check_available()?;
        check_partition(topic, partition, self.partitions)?;
        let mut state = self.lock()?;
        let current = state
            .committed
            .entry((group.to_string(), topic.to_string(), partition))
            .or_insert(0);
        if next_offset > *current {
            *current = next_offset;
        } else {
            debug!(group, topic, partition, next_offset, current = *current, "ignoring stale commit");
        }
        Ok(())
    }

    async fn offsets(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<PartitionOffsets, BrokerError> {
        self.check_available()?;
        check_partition(topic, partition, self.partitions)?;
        let state = self.lock()?;
        let committed = state
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
            .unwrap_or(0);
        let end = state
            .logs
            .get(topic)
            .map(|log| log[partition as usize].len() as u64)
            .unwrap_or(0);
        Ok(PartitionOffsets {
            partition,
            committed,
            end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const TOPIC: &str = "stage-events";
    const GROUP: &str = "executors";

    fn message(key: &str, body: &str) -> OutgoingMessage {
        OutgoingMessage {
            key: key.to_string(),
            payload: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_fetch_returns_uncommitted_until_commit() {
        let broker = InMemoryBroker::new(1);
        broker
            .publish(TOPIC, vec![message("a", "1"), message("a", "2")])
            .await
            .unwrap();

        let first = broker.fetch(GROUP, TOPIC, 0, 10).await.unwrap();
        assert_eq!(first.len(), 2);

        // Not committed: fetched again
        let again = broker.fetch(GROUP, TOPIC, 0, 10).await.unwrap();
        assert_eq!(again, first);

        broker.commit(GROUP, TOPIC, 0, 1).await.unwrap();
        let rest = broker.fetch(GROUP, TOPIC, 0, 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].offset, 1);
        assert_eq!(rest[0].payload, b"2");
    }

    #[tokio::test]
    async fn test_commit_is_monotonic() {
        let broker = InMemoryBroker::new(1);
        broker.publish(TOPIC, vec![message("a", "1")]).await.unwrap();
        broker.commit(GROUP, TOPIC, 0, 1).await.unwrap();
        broker.commit(GROUP, TOPIC, 0, 0).await.unwrap();

        let offsets = broker.offsets(GROUP, TOPIC, 0).await.unwrap();
        assert_eq!(offsets.committed, 1);
        assert_eq!(offsets.end, 1);
        assert_eq!(offsets.lag(), 0);
    }

    #[tokio::test]
    async fn test_groups_are_independent() {
        let broker = InMemoryBroker::new(1);
        broker.publish(TOPIC, vec![message("a", "1")]).await.unwrap();
        broker.commit(GROUP, TOPIC, 0, 1).await.unwrap();

        let other = broker.fetch("other", TOPIC, 0, 10).await.unwrap();
        assert_eq!(other.len(), 1);
    }

    #[tokio::test]
    async fn test_same_key_same_partition() {
        let broker = InMemoryBroker::new(4);
        let key = Uuid::now_v7().to_string();
        for i in 0..5 {
            broker
                .publish(TOPIC, vec![message(&key, &i.to_string())])
                .await
                .unwrap();
        }
        let messages = broker.messages(TOPIC);
        assert_eq!(messages.len(), 5);
        let partition = messages[0].partition;
        assert!(messages.iter().all(|m| m.partition == partition));
        let bodies: Vec<_> = messages.iter().map(|m| m.payload.clone()).collect();
        assert_eq!(bodies, vec![b"0".to_vec(), b"1".to_vec(), b"2".to_vec(), b"3".to_vec(), b"4".to_vec()]);
    }

    #[tokio::test]
    async fn test_partial_publish_failure() {
        let broker = InMemoryBroker::new(1);
        broker.fail_next_publish_after(1);
        let err = broker
            .publish(TOPIC, vec![message("a", "1"), message("a", "2")])
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Publish(_)));
        assert_eq!(broker.messages(TOPIC).len(), 1);

        // One-shot: the next publish succeeds
        broker.publish(TOPIC, vec![message("a", "3")]).await.unwrap();
        assert_eq!(broker.messages(TOPIC).len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let broker = InMemoryBroker::new(1);
        broker.set_available(false);
        assert!(matches!(
            broker.publish(TOPIC, vec![message("a", "1")]).await,
            Err(BrokerError::Unavailable(_))
        ));
        assert!(broker.fetch(GROUP, TOPIC, 0, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_rejects_out_of_range_partition() {
        let broker = InMemoryBroker::new(2);
        assert!(matches!(
            broker.fetch(GROUP, TOPIC, 2, 1).await,
            Err(BrokerError::InvalidPartition { .. })
        ));
    }
}
