use thiserror::Error;

/// Errors from repository operations (used by the `RunStore` port in relayflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors from message broker operations.
///
/// Every variant is transient from the engine's point of view: the relay keeps
/// the outbox rows and the executor leaves the offset uncommitted.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("offset commit failed: {0}")]
    Commit(String),

    #[error("partition {partition} out of range for topic '{topic}' ({count} partitions)")]
    InvalidPartition {
        topic: String,
        partition: u32,
        count: u32,
    },

    #[error("topic '{topic}' was created with {stored} partitions but {configured} are configured")]
    PartitionMismatch {
        topic: String,
        stored: u32,
        configured: u32,
    },
}

/// Errors related to workflow definitions.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow has no actions")]
    NoActions,

    #[error("duplicate sorting order {0}")]
    DuplicateSortingOrder(u32),

    #[error("sorting orders are not contiguous from zero: missing {0}")]
    MissingSortingOrder(u32),

    #[error("invalid action type id: '{0}'")]
    InvalidActionType(String),

    #[error("failed to parse workflow: {0}")]
    Parse(String),
}
