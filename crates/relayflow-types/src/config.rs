//! Configuration types for relayflow.
//!
//! `RelayflowConfig` represents the top-level `relayflow.toml`. Every field
//! has a default, so an empty file (or no file) yields a working single-host
//! setup. Relay and executor must agree on `broker.topic`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayflowConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

/// Run store connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite URL. `None` means `{data_dir}/store.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

/// Broker connection and topic settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// SQLite URL of the broker log. `None` means `{data_dir}/broker.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    /// Stage-event topic shared by relay and executor.
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Topic receiving events whose action exhausted its attempts.
    #[serde(default = "default_dead_letter_topic")]
    pub dead_letter_topic: String,
    /// Partition count for every topic.
    #[serde(default = "default_partitions")]
    pub partitions: u32,
}

fn default_topic() -> String {
    "stage-events".to_string()
}

fn default_dead_letter_topic() -> String {
    "stage-events-dlq".to_string()
}

fn default_partitions() -> u32 {
    8
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            topic: default_topic(),
            dead_letter_topic: default_dead_letter_topic(),
            partitions: default_partitions(),
        }
    }
}

/// Outbox relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Maximum outbox rows moved per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Idle delay after an empty (or failed) cycle.
    #[serde(default = "default_relay_poll_ms")]
    pub poll_interval_ms: u64,
}

fn default_batch_size() -> u32 {
    10
}

fn default_relay_poll_ms() -> u64 {
    1000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_ms: default_relay_poll_ms(),
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Stage executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Consumer group id. Executors sharing it split the partitions.
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Maximum messages fetched per partition poll.
    #[serde(default = "default_fetch_max")]
    pub fetch_max: u32,
    /// Idle delay when a partition has no new messages.
    #[serde(default = "default_executor_poll_ms")]
    pub poll_interval_ms: u64,
    /// Delay before re-fetching after a transient failure.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Upper bound on a single action handler call.
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
    /// Pause after a successful action before advancing the run.
    #[serde(default)]
    pub stage_delay_ms: u64,
    /// Attempts per stage before dead-lettering. `0` redelivers forever.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Partitions consumed by this process. `None` means all of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<Vec<u32>>,
    /// Port of the worker health endpoint.
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

fn default_group_id() -> String {
    "stage-executors".to_string()
}

fn default_fetch_max() -> u32 {
    16
}

fn default_executor_poll_ms() -> u64 {
    250
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_handler_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_health_port() -> u16 {
    3004
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            fetch_max: default_fetch_max(),
            poll_interval_ms: default_executor_poll_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            handler_timeout_secs: default_handler_timeout_secs(),
            stage_delay_ms: 0,
            max_attempts: default_max_attempts(),
            partitions: None,
            health_port: default_health_port(),
        }
    }
}

impl ExecutorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn stage_delay(&self) -> Duration {
        Duration::from_millis(self.stage_delay_ms)
    }
}
