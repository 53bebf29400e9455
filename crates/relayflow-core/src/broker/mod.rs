//! Message broker port.
//!
//! The broker is an ordered, partitioned log. Producers publish keyed
//! messages; a message's partition is derived from its key, so every stage
//! event of one run lands on the same partition. Consumers in a group fetch
//! from their committed offset and commit only after processing, which gives
//! at-least-once delivery: anything fetched but not committed is fetched
//! again.

pub mod memory;

use relayflow_types::error::BrokerError;
use relayflow_types::event::StageEvent;
use sha2::{Digest, Sha256};

/// A message to be appended to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Partitioning key.
    pub key: String,
    pub payload: Vec<u8>,
}

impl OutgoingMessage {
    /// Encode a stage event keyed by its run id.
    pub fn stage_event(event: &StageEvent) -> Result<Self, BrokerError> {
        let payload = event
            .to_bytes()
            .map_err(|e| BrokerError::Publish(format!("encode stage event: {e}")))?;
        Ok(Self {
            key: event.key(),
            payload,
        })
    }
}

/// A message read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Vec<u8>,
}

/// Consumer position within one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionOffsets {
    pub partition: u32,
    /// Next offset the group will fetch.
    pub committed: u64,
    /// Offset the next published message will get.
    pub end: u64,
}

impl PartitionOffsets {
    /// Messages published but not yet committed by the group.
    pub fn lag(&self) -> u64 {
        self.end.saturating_sub(self.committed)
    }
}

/// Partitioned log broker with consumer-group offsets.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods,
/// consistent with the repository traits.
pub trait StageBroker: Send + Sync {
    /// Number of partitions of `topic`.
    fn partition_count(&self, topic: &str) -> u32;

    /// Append `messages` to `topic`. Returns only once the broker
    /// acknowledged the whole batch; an error means some, none, or all of the
    /// messages may have been written.
    fn publish(
        &self,
        topic: &str,
        messages: Vec<OutgoingMessage>,
    ) -> impl std::future::Future<Output = Result<(), BrokerError>> + Send;

    /// Read up to `max` messages of one partition, starting at the group's
    /// committed offset.
    fn fetch(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        max: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Delivery>, BrokerError>> + Send;

    /// Record that the group processed everything before `next_offset`.
    /// Commits never move an offset backwards.
    fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        next_offset: u64,
    ) -> impl std::future::Future<Output = Result<(), BrokerError>> + Send;

    /// Committed and end offsets of one partition for a group.
    fn offsets(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> impl std::future::Future<Output = Result<PartitionOffsets, BrokerError>> + Send;
}

/// Publish a single stage event.
pub async fn publish_event<B: StageBroker + ?Sized>(
    broker: &B,
    topic: &str,
    event: &StageEvent,
) -> Result<(), BrokerError> {
    let message = OutgoingMessage::stage_event(event)?;
    broker.publish(topic, vec![message]).await
}

/// Map a key to a partition. Stable across processes and releases.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partitions)) as u32
}

/// Reject partitions outside `0..count`.
pub fn check_partition(topic: &str, partition: u32, count: u32) -> Result<(), BrokerError> {
    if partition < count {
        Ok(())
    } else {
        Err(BrokerError::InvalidPartition {
            topic: topic.to_string(),
            partition,
            count,
        })
    }
}
