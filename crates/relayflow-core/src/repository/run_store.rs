//! Run store trait definition.
//!
//! The relay and the executor touch only a narrow slice of the run store:
//! pending outbox rows, their deletion, and read-only access to a run plus
//! its workflow definition. Run creation belongs to the ingestion path and is
//! not part of this port.

use relayflow_types::error::RepositoryError;
use relayflow_types::workflow::{OutboxEntry, RunWithDefinition};
use uuid::Uuid;

/// Storage port for the outbox relay and the stage executor.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunStore: Send + Sync {
    /// Fetch up to `limit` pending outbox entries, oldest first.
    fn fetch_pending_outbox(
        &self,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<OutboxEntry>, RepositoryError>> + Send;

    /// Delete outbox entries by id. Returns how many rows were removed;
    /// ids that no longer exist are ignored.
    fn delete_pending(
        &self,
        ids: &[Uuid],
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Load a run together with its workflow definition.
    fn load_run_with_definition(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<RunWithDefinition>, RepositoryError>> + Send;

    /// Number of outbox entries still waiting for the relay.
    fn count_pending_outbox(
        &self,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
