//! SQLite-backed partitioned log broker.
//!
//! Implements `StageBroker` from `relayflow-core` on its own database file.
//! Each topic has a fixed number of partitions; a message's partition is
//! derived from its key. Offsets are dense per partition and assigned inside
//! the single writer connection, so concurrent publishers never collide.
//! Consumer groups track the next offset to fetch per partition, and commits
//! never move that offset backwards.
//!
//! A topic's partition count is recorded on its first publish. Opening the
//! database with a different count, or publishing to a topic created with
//! one, fails with `BrokerError::PartitionMismatch`: messages already logged
//! would otherwise sit on partitions no consumer visits.

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use relayflow_core::broker::{
    Delivery, OutgoingMessage, PartitionOffsets, StageBroker, check_partition, partition_for,
};
use relayflow_types::error::BrokerError;
use sqlx::Row;

use super::pool::DatabasePool;

/// Durable `StageBroker` over a SQLite database.
pub struct SqliteBroker {
    pool: DatabasePool,
    partitions: u32,
}

impl SqliteBroker {
    /// Open a broker whose topics all have `partitions` partitions.
    ///
    /// Fails if any topic already in the database was created with a
    /// different partition count.
    pub async fn open(pool: DatabasePool, partitions: u32) -> Result<Self, BrokerError> {
        let partitions = partitions.max(1);
        let topics: Vec<(String, i64)> =
            sqlx::query_as("SELECT topic, partitions FROM broker_topics ORDER BY topic")
                .fetch_all(&pool.reader)
                .await
                .map_err(|e| map_sqlx(e, BrokerError::Fetch))?;

        for (topic, stored) in topics {
            check_partition_count(&topic, stored, partitions)?;
        }
        Ok(Self { pool, partitions })
    }

    /// Total number of messages in `topic`.
    pub async fn topic_len(&self, topic: &str) -> Result<u64, BrokerError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM broker_messages WHERE topic = ?")
            .bind(topic)
            .fetch_one(&self.pool.reader)
            .await
            .map_err(|e| map_sqlx(e, BrokerError::Fetch))?;
        Ok(count as u64)
    }
}

impl StageBroker for SqliteBroker {
    fn partition_count(&self, _topic: &str) -> u32 {
        self.partitions
    }

    async fn publish(&self, topic: &str, messages: Vec<OutgoingMessage>) -> Result<(), BrokerError> {
        if messages.is_empty() {
            return Ok(());
        }

        let published_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| map_sqlx(e, BrokerError::Publish))?;

        sqlx::query(
            "INSERT INTO broker_topics (topic, partitions, created_at) VALUES (?, ?, ?)
             ON CONFLICT (topic) DO NOTHING",
        )
        .bind(topic)
        .bind(i64::from(self.partitions))
        .bind(&published_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx(e, BrokerError::Publish))?;

        let (stored,): (i64,) = sqlx::query_as("SELECT partitions FROM broker_topics WHERE topic = ?")
            .bind(topic)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx(e, BrokerError::Publish))?;
        check_partition_count(topic, stored, self.partitions)?;

        // Next free offset per partition touched by this batch
        let mut next_offsets: HashMap<u32, i64> = HashMap::new();

        for message in messages {
            let partition = partition_for(&message.key, self.partitions);
            let offset = match next_offsets.get(&partition) {
                Some(offset) => *offset,
                None => {
                    let (end,): (i64,) = sqlx::query_as(
                        "SELECT COALESCE(MAX(msg_offset) + 1, 0) FROM broker_messages
                         WHERE topic = ? AND partition_id = ?",
                    )
                    .bind(topic)
                    .bind(i64::from(partition))
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx(e, BrokerError::Publish))?;
                    end
                }
            };

            sqlx::query(
                "INSERT INTO broker_messages (topic, partition_id, msg_offset, msg_key, payload, published_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(topic)
            .bind(i64::from(partition))
            .bind(offset)
            .bind(&message.key)
            .bind(&message.payload)
            .bind(&published_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx(e, BrokerError::Publish))?;

            next_offsets.insert(partition, offset + 1);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx(e, BrokerError::Publish))?;
        Ok(())
    }

    async fn fetch(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        max: u32,
    ) -> Result<Vec<Delivery>, BrokerError> {
        check_partition(topic, partition, self.partitions)?;

        let rows = sqlx::query(
            "SELECT msg_offset, msg_key, payload FROM broker_messages
             WHERE topic = ?1 AND partition_id = ?2
               AND msg_offset >= COALESCE(
                   (SELECT next_offset FROM broker_offsets
                    WHERE group_id = ?3 AND topic = ?1 AND partition_id = ?2), 0)
             ORDER BY msg_offset ASC
             LIMIT ?4",
        )
        .bind(topic)
        .bind(i64::from(partition))
        .bind(group)
        .bind(i64::from(max))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| map_sqlx(e, BrokerError::Fetch))?;

        rows.iter()
            .map(|row| {
                let offset: i64 = row
                    .try_get("msg_offset")
                    .map_err(|e| map_sqlx(e, BrokerError::Fetch))?;
                Ok(Delivery {
                    topic: topic.to_string(),
                    partition,
                    offset: offset as u64,
                    key: row
                        .try_get("msg_key")
                        .map_err(|e| map_sqlx(e, BrokerError::Fetch))?,
                    payload: row
                        .try_get("payload")
                        .map_err(|e| map_sqlx(e, BrokerError::Fetch))?,
                })
            })
            .collect()
    }

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        next_offset: u64,
    ) -> Result<(), BrokerError> {
        check_partition(topic, partition, self.partitions)?;

        sqlx::query(
            "INSERT INTO broker_offsets (group_id, topic, partition_id, next_offset, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (group_id, topic, partition_id) DO UPDATE
             SET next_offset = excluded.next_offset, updated_at = excluded.updated_at
             WHERE excluded.next_offset > broker_offsets.next_offset",
        )
        .bind(group)
        .bind(topic)
        .bind(i64::from(partition))
        .bind(next_offset as i64)
        .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| map_sqlx(e, BrokerError::Commit))?;
        Ok(())
    }

    async fn offsets(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<PartitionOffsets, BrokerError> {
        check_partition(topic, partition, self.partitions)?;

        let (committed, end): (i64, i64) = sqlx::query_as(
            "SELECT
                COALESCE((SELECT next_offset FROM broker_offsets
                          WHERE group_id = ?1 AND topic = ?2 AND partition_id = ?3), 0),
                COALESCE((SELECT MAX(msg_offset) + 1 FROM broker_messages
                          WHERE topic = ?2 AND partition_id = ?3), 0)",
        )
        .bind(group)
        .bind(topic)
        .bind(i64::from(partition))
        .fetch_one(&self.pool.reader)
        .await
        .map_err(|e| map_sqlx(e, BrokerError::Fetch))?;

        Ok(PartitionOffsets {
            partition,
            committed: committed as u64,
            end: end as u64,
        })
    }
}

fn check_partition_count(topic: &str, stored: i64, configured: u32) -> Result<(), BrokerError> {
    if stored == i64::from(configured) {
        Ok(())
    } else {
        Err(BrokerError::PartitionMismatch {
            topic: topic.to_string(),
            stored: stored as u32,
            configured,
        })
    }
}

/// Connection-level failures become `Unavailable`; everything else is
/// reported through `op`.
fn map_sqlx(e: sqlx::Error, op: fn(String) -> BrokerError) -> BrokerError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            BrokerError::Unavailable(e.to_string())
        }
        other => op(other.to_string()),
    }
}
