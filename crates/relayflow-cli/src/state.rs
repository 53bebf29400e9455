//! Application state wiring the store, the broker, and the engine together.
//!
//! The core relay and executor are generic over their ports; AppState pins
//! them to the SQLite implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use relayflow_core::action::registry::ActionRegistry;
use relayflow_core::workflow::executor::{ExecutorSettings, StageExecutor};
use relayflow_core::workflow::relay::OutboxRelay;
use relayflow_infra::action::builtin_registry;
use relayflow_infra::config::{
    CONFIG_FILE_NAME, broker_database_url, load_config, resolve_data_dir, store_database_url,
};
use relayflow_infra::sqlite::broker::SqliteBroker;
use relayflow_infra::sqlite::pool::DatabasePool;
use relayflow_infra::sqlite::run_store::SqliteRunStore;
use relayflow_types::config::RelayflowConfig;

/// Concrete type aliases for the engine generics pinned to infra implementations.
pub type ConcreteRelay = OutboxRelay<SqliteRunStore, SqliteBroker>;

pub type ConcreteExecutor = StageExecutor<SqliteRunStore, SqliteBroker>;

/// Shared application state used by every command.
pub struct AppState {
    pub config: RelayflowConfig,
    pub data_dir: PathBuf,
    pub store: Arc<SqliteRunStore>,
    pub broker: Arc<SqliteBroker>,
}

impl AppState {
    /// Load config, open (and migrate) both databases.
    pub async fn init(config_path: Option<&Path>) -> anyhow::Result<Self> {
        Self::open(resolve_data_dir(), config_path).await
    }

    /// Like `init`, with an explicit data directory.
    pub async fn open(data_dir: PathBuf, config_path: Option<&Path>) -> anyhow::Result<Self> {
        // Ensure data directory exists
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let config_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| data_dir.join(CONFIG_FILE_NAME));
        let config = load_config(&config_path).await?;

        let store_url = store_database_url(&config, &data_dir);
        let store_pool = DatabasePool::store(&store_url)
            .await
            .with_context(|| format!("failed to open run store at {store_url}"))?;

        let broker_url = broker_database_url(&config, &data_dir);
        let broker_pool = DatabasePool::broker(&broker_url)
            .await
            .with_context(|| format!("failed to open broker at {broker_url}"))?;

        let broker = SqliteBroker::open(broker_pool, config.broker.partitions)
            .await
            .with_context(|| format!("broker at {broker_url} does not match broker.partitions"))?;

        tracing::debug!(
            data_dir = %data_dir.display(),
            topic = %config.broker.topic,
            partitions = config.broker.partitions,
            "application state initialized"
        );

        Ok(Self {
            store: Arc::new(SqliteRunStore::new(store_pool)),
            broker: Arc::new(broker),
            config,
            data_dir,
        })
    }

    pub fn relay(&self) -> ConcreteRelay {
        OutboxRelay::new(
            Arc::clone(&self.store),
            Arc::clone(&self.broker),
            self.config.broker.topic.clone(),
            &self.config.relay,
        )
    }

    /// Executor with the built-in action handlers. `partitions` overrides
    /// the configured assignment.
    pub fn executor(&self, partitions: Option<Vec<u32>>) -> anyhow::Result<ConcreteExecutor> {
        let mut settings = ExecutorSettings::from_config(&self.config.broker, &self.config.executor);
        if partitions.is_some() {
            settings.partitions = partitions;
        }

        Ok(StageExecutor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.broker),
            Arc::new(self.registry()?),
            settings,
        ))
    }

    /// The built-in action handlers.
    pub fn registry(&self) -> anyhow::Result<ActionRegistry> {
        builtin_registry(self.config.executor.handler_timeout())
            .context("failed to build action handlers")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use relayflow_core::action::box_handler::BoxActionHandler;
    use relayflow_core::action::{ActionError, ActionHandler, ActionInvocation, ActionOutput};
    use relayflow_core::broker::{StageBroker, partition_for};
    use relayflow_core::repository::run_store::RunStore;
    use relayflow_core::workflow::executor::{Disposition, PollOutcome};
    use relayflow_types::error::BrokerError;
    use relayflow_types::event::StageEvent;
    use uuid::Uuid;

    const TWO_STAGES: &str = r#"
name = "two-stages"

[trigger]
type = "webhook"

[[actions]]
type = "count"

[[actions]]
type = "count"
"#;

    /// Records the stage of every call.
    #[derive(Clone, Default)]
    struct StageCounter {
        stages: Arc<Mutex<Vec<u32>>>,
    }

    impl StageCounter {
        fn stages(&self) -> Vec<u32> {
            self.stages.lock().unwrap().clone()
        }
    }

    impl ActionHandler for StageCounter {
        async fn execute(&self, invocation: &ActionInvocation) -> Result<ActionOutput, ActionError> {
            self.stages.lock().unwrap().push(invocation.stage);
            Ok(serde_json::json!({}))
        }
    }

    fn counting_executor(state: &AppState, counter: &StageCounter) -> ConcreteExecutor {
        let mut registry = ActionRegistry::new();
        registry.register("count", BoxActionHandler::new(counter.clone()));
        StageExecutor::new(
            Arc::clone(&state.store),
            Arc::clone(&state.broker),
            Arc::new(registry),
            ExecutorSettings::from_config(&state.config.broker, &state.config.executor),
        )
    }

    /// Enqueue a run of a fresh two-stage workflow and relay it.
    async fn relayed_run(state: &AppState) -> Uuid {
        let def = relayflow_infra::workflow::parse_definition(TWO_STAGES, false).unwrap();
        state.store.save_workflow(&def).await.unwrap();
        let run = state
            .store
            .create_run_with_outbox(&def.id, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(state.relay().drain_once().await.unwrap().published, 1);
        run.id
    }

    const WORKFLOW: &str = r#"
name = "greet"

[trigger]
type = "webhook"

[[actions]]
type = "log"
metadata = { message = "hello {{name}}" }
"#;

    #[tokio::test]
    async fn test_register_workflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::open(dir.path().to_path_buf(), None).await.unwrap();
        assert_eq!(state.config.broker.topic, "stage-events");

        let file = dir.path().join("greet.toml");
        tokio::fs::write(&file, WORKFLOW).await.unwrap();
        crate::cli::workflow::register(&state, &file, true).await.unwrap();

        let bad = dir.path().join("empty.toml");
        tokio::fs::write(&bad, "name = \"empty\"\n[trigger]\ntype = \"webhook\"\n")
            .await
            .unwrap();
        assert!(crate::cli::workflow::register(&state, &bad, true).await.is_err());
    }

    #[tokio::test]
    async fn test_trigger_enqueues_and_relay_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::open(dir.path().to_path_buf(), None).await.unwrap();

        let def = relayflow_infra::workflow::parse_definition(WORKFLOW, false).unwrap();
        state.store.save_workflow(&def).await.unwrap();

        crate::cli::workflow::trigger(&state, def.id, Some(r#"{"name":"ada"}"#), true)
            .await
            .unwrap();
        assert_eq!(state.store.count_pending_outbox().await.unwrap(), 1);

        let report = state.relay().drain_once().await.unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(state.store.count_pending_outbox().await.unwrap(), 0);

        let topic = &state.config.broker.topic;
        let mut events = Vec::new();
        for partition in 0..state.broker.partition_count(topic) {
            for delivery in state
                .broker
                .fetch("test", topic, partition, 10)
                .await
                .unwrap()
            {
                events.push(StageEvent::from_bytes(&delivery.payload).unwrap());
            }
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stage, 0);
    }

    #[tokio::test]
    async fn test_trigger_rejects_non_object_payload() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::open(dir.path().to_path_buf(), None).await.unwrap();
        let def = relayflow_infra::workflow::parse_definition(WORKFLOW, false).unwrap();
        state.store.save_workflow(&def).await.unwrap();

        let err = crate::cli::workflow::trigger(&state, def.id, Some("[1,2]"), true).await;
        assert!(err.is_err());
        assert_eq!(state.store.count_pending_outbox().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_executor_respects_partition_override() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::open(dir.path().to_path_buf(), None).await.unwrap();
        let executor = state.executor(Some(vec![1, 3])).unwrap();
        assert_eq!(executor.settings().partitions, Some(vec![1, 3]));
        assert!(state.registry().unwrap().contains("webhook"));
    }

    #[tokio::test]
    async fn test_uncommitted_stage_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::open(dir.path().to_path_buf(), None).await.unwrap();
        let run_id = relayed_run(&state).await;

        let topic = state.config.broker.topic.clone();
        let group = state.config.executor.group_id.clone();
        let partition = partition_for(&run_id.to_string(), state.config.broker.partitions);

        // Stage 0 runs, then the process dies before committing its offset
        let before = StageCounter::default();
        let executor = counting_executor(&state, &before);
        let deliveries = state.broker.fetch(&group, &topic, partition, 10).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(executor.process(&deliveries[0]).await, Disposition::Commit);
        assert_eq!(before.stages(), vec![0]);
        drop(executor);
        drop(state);

        let state = AppState::open(dir.path().to_path_buf(), None).await.unwrap();
        let after = StageCounter::default();
        let executor = counting_executor(&state, &after);
        for _ in 0..10 {
            if executor.poll_partition(partition).await.unwrap() == PollOutcome::Idle {
                break;
            }
        }

        // Stage 0 is redelivered. Its follow-up was published before the
        // crash and again on redelivery, so stage 1 runs twice.
        assert_eq!(after.stages(), vec![0, 1, 1]);

        let offsets = state.broker.offsets(&group, &topic, partition).await.unwrap();
        assert_eq!(offsets.end, 3);
        assert_eq!(offsets.committed, offsets.end);
    }

    #[tokio::test]
    async fn test_fetched_but_unprocessed_stage_runs_once_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::open(dir.path().to_path_buf(), None).await.unwrap();
        let run_id = relayed_run(&state).await;
        let partition = partition_for(&run_id.to_string(), state.config.broker.partitions);

        let fetched = state
            .broker
            .fetch(&state.config.executor.group_id, &state.config.broker.topic, partition, 10)
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        drop(state);

        let state = AppState::open(dir.path().to_path_buf(), None).await.unwrap();
        let counter = StageCounter::default();
        let executor = counting_executor(&state, &counter);
        for _ in 0..10 {
            if executor.poll_partition(partition).await.unwrap() == PollOutcome::Idle {
                break;
            }
        }
        assert_eq!(counter.stages(), vec![0, 1]);

        let offsets = state
            .broker
            .offsets(&state.config.executor.group_id, &state.config.broker.topic, partition)
            .await
            .unwrap();
        assert_eq!((offsets.committed, offsets.end), (2, 2));
    }

    #[tokio::test]
    async fn test_reopen_with_changed_partition_count_fails() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::open(dir.path().to_path_buf(), None).await.unwrap();
        relayed_run(&state).await;
        drop(state);

        let config = dir.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(&config, "[broker]\npartitions = 4\n").await.unwrap();
        let err = AppState::open(dir.path().to_path_buf(), Some(&config))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<BrokerError>(),
            Some(BrokerError::PartitionMismatch {
                stored: 8,
                configured: 4,
                ..
            })
        ));
    }
}
