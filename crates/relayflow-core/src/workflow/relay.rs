//! Outbox relay: moves pending runs from the run store onto the broker.
//!
//! Each cycle fetches a batch of pending outbox entries, publishes one
//! stage-0 event per entry as a single batch, and deletes the entries only
//! after the broker acknowledged the whole batch. A failed publish deletes
//! nothing, so the entries are picked up again on the next cycle. A crash
//! between acknowledgement and delete republishes the batch; the executor
//! tolerates duplicate stage-0 events.

use std::sync::Arc;
use std::time::Duration;

use relayflow_types::config::RelayConfig;
use relayflow_types::error::{BrokerError, RepositoryError};
use relayflow_types::event::StageEvent;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::{OutgoingMessage, StageBroker};
use crate::repository::run_store::RunStore;

/// Errors from a single relay cycle. Neither is fatal to the loop.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("run store error: {0}")]
    Store(#[from] RepositoryError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Result of one successful drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub fetched: usize,
    pub published: usize,
    pub deleted: u64,
}

/// Polls the outbox and hands pending runs to the broker.
pub struct OutboxRelay<S, B> {
    store: Arc<S>,
    broker: Arc<B>,
    topic: String,
    batch_size: u32,
    poll_interval: Duration,
}

impl<S: RunStore, B: StageBroker> OutboxRelay<S, B> {
    pub fn new(store: Arc<S>, broker: Arc<B>, topic: impl Into<String>, config: &RelayConfig) -> Self {
        Self {
            store,
            broker,
            topic: topic.into(),
            batch_size: config.batch_size.max(1),
            poll_interval: config.poll_interval(),
        }
    }

    /// Run one fetch-publish-delete cycle.
    pub async fn drain_once(&self) -> Result<DrainReport, RelayError> {
        let entries = self.store.fetch_pending_outbox(self.batch_size).await?;
        if entries.is_empty() {
            return Ok(DrainReport::default());
        }

        let messages = entries
            .iter()
            .map(|entry| OutgoingMessage::stage_event(&StageEvent::first(entry.run_id)))
            .collect::<Result<Vec<_>, _>>()?;
        let published = messages.len();

        self.broker.publish(&self.topic, messages).await?;

        let ids: Vec<Uuid> = entries.iter().map(|e| e.id).collect();
        let deleted = self.store.delete_pending(&ids).await?;
        if deleted < ids.len() as u64 {
            // Another relay got there first; its publish was a duplicate too
            tracing::debug!(
                expected = ids.len(),
                deleted,
                "some outbox entries were already removed"
            );
        }

        tracing::info!(
            topic = %self.topic,
            count = published,
            "relayed pending runs"
        );

        Ok(DrainReport {
            fetched: entries.len(),
            published,
            deleted,
        })
    }

    /// Drain until `cancel` fires. A full batch is followed immediately by
    /// another cycle; an empty, partial, or failed cycle waits one poll
    /// interval.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            topic = %self.topic,
            batch_size = self.batch_size,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "outbox relay started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let full_batch = match self.drain_once().await {
                Ok(report) => report.fetched as u32 >= self.batch_size,
                Err(RelayError::Broker(e)) => {
                    tracing::warn!(error = %e, "publish failed, outbox entries kept for next cycle");
                    false
                }
                Err(RelayError::Store(e)) => {
                    tracing::error!(error = %e, "outbox poll failed");
                    false
                }
            };

            if full_batch {
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracing::info!("outbox relay stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
