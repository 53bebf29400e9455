//! Stage executor: drives workflow runs one stage at a time.
//!
//! Every stage of a run is a `StageEvent` on the broker topic. Handling an
//! event loads the run and its definition, resolves the current action's
//! metadata against the trigger payload, invokes the registered handler, and
//! publishes the next stage's event if there is one. The consumer offset is
//! committed only once that whole unit of work is done, so a crash or a
//! transient failure anywhere in it leads to redelivery (at-least-once).
//!
//! One worker task runs per assigned partition. Events of a run share a key
//! and therefore a partition, and a worker processes its partition strictly
//! in offset order, so the stages of a run never execute concurrently or out
//! of order.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relayflow_types::config::{BrokerConfig, ExecutorConfig};
use relayflow_types::error::{BrokerError, RepositoryError};
use relayflow_types::event::{DeadLetter, StageEvent};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::action::registry::ActionRegistry;
use crate::action::{ActionError, ActionInvocation};
use crate::broker::{Delivery, OutgoingMessage, StageBroker, check_partition, publish_event};
use crate::repository::run_store::RunStore;

use super::retry::{RetryDecision, RetryPolicy};
use super::template::resolve_fields;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Runtime settings of a `StageExecutor`.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub topic: String,
    pub dead_letter_topic: String,
    pub group_id: String,
    pub fetch_max: u32,
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
    pub handler_timeout: Duration,
    pub stage_delay: Duration,
    pub retry_policy: RetryPolicy,
    /// Partitions to consume. `None` means every partition of the topic.
    pub partitions: Option<Vec<u32>>,
}

impl ExecutorSettings {
    pub fn from_config(broker: &BrokerConfig, executor: &ExecutorConfig) -> Self {
        Self {
            topic: broker.topic.clone(),
            dead_letter_topic: broker.dead_letter_topic.clone(),
            group_id: executor.group_id.clone(),
            fetch_max: executor.fetch_max.max(1),
            poll_interval: executor.poll_interval(),
            retry_backoff: executor.retry_backoff(),
            handler_timeout: executor.handler_timeout(),
            stage_delay: executor.stage_delay(),
            retry_policy: RetryPolicy::from_max_attempts(executor.max_attempts),
            partitions: executor.partitions.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes and errors
// ---------------------------------------------------------------------------

/// Result of a successfully handled stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The action ran and `next` was published.
    Advanced { next: StageEvent },
    /// The action ran and it was the run's last stage.
    Completed,
}

/// Why a stage could not be handled.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("run {run_id} has no action at stage {stage}")]
    StageNotFound { run_id: Uuid, stage: u32 },

    #[error("no handler registered for action type '{0}'")]
    UnknownActionType(String),

    #[error("undecodable stage event: {0}")]
    Decode(String),

    #[error("action '{action_type_id}' failed: {source}")]
    Action {
        action_type_id: String,
        #[source]
        source: ActionError,
    },

    #[error("run store error: {0}")]
    Store(#[from] RepositoryError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// How the executor treats a `StageError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Infrastructure hiccup: leave the offset uncommitted and re-fetch.
    Transient,
    /// The event can never succeed: log, commit, move on.
    Drop,
    /// The action failed: apply the retry policy.
    Retryable,
    /// Retrying cannot help, but the event is not garbage: dead-letter it.
    Permanent,
}

impl StageError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Store(_) | Self::Broker(_) => FailureKind::Transient,
            Self::RunNotFound(_) | Self::StageNotFound { .. } | Self::Decode(_) => FailureKind::Drop,
            Self::Action { .. } => FailureKind::Retryable,
            Self::UnknownActionType(_) => FailureKind::Permanent,
        }
    }

    fn action_type_id(&self) -> Option<&str> {
        match self {
            Self::Action { action_type_id, .. } | Self::UnknownActionType(action_type_id) => {
                Some(action_type_id)
            }
            _ => None,
        }
    }
}

/// What to do with a delivery's offset after processing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Commit,
    Redeliver,
}

/// Result of one fetch-and-process round on a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing to fetch.
    Idle,
    /// Every fetched message was processed and committed.
    Progressed(usize),
    /// A message must be redelivered; the round stopped there.
    Stalled,
}

// ---------------------------------------------------------------------------
// StageExecutor
// ---------------------------------------------------------------------------

/// Consumes stage events and executes workflow actions.
pub struct StageExecutor<S, B> {
    store: Arc<S>,
    broker: Arc<B>,
    registry: Arc<ActionRegistry>,
    settings: ExecutorSettings,
}

impl<S: RunStore + 'static, B: StageBroker + 'static> StageExecutor<S, B> {
    pub fn new(
        store: Arc<S>,
        broker: Arc<B>,
        registry: Arc<ActionRegistry>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            broker,
            registry,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Execute one stage: run its action and publish the next stage.
    pub async fn handle(&self, event: &StageEvent) -> Result<StageOutcome, StageError> {
        let loaded = self
            .store
            .load_run_with_definition(&event.run_id)
            .await?
            .ok_or(StageError::RunNotFound(event.run_id))?;

        let action = loaded
            .definition
            .action_at(event.stage)
            .ok_or(StageError::StageNotFound {
                run_id: event.run_id,
                stage: event.stage,
            })?;

        let handler = self
            .registry
            .get(&action.action_type_id)
            .ok_or_else(|| StageError::UnknownActionType(action.action_type_id.clone()))?;

        let invocation = ActionInvocation {
            run_id: event.run_id,
            stage: event.stage,
            attempt: event.attempt,
            action_id: action.id,
            action_type_id: action.action_type_id.clone(),
            fields: resolve_fields(&action.metadata, &loaded.run.trigger_payload),
            idempotency_key: event.idempotency_key(),
        };

        let timeout = self.settings.handler_timeout;
        let output = match tokio::time::timeout(timeout, handler.execute(&invocation)).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(StageError::Action {
                    action_type_id: invocation.action_type_id.clone(),
                    source,
                });
            }
            Err(_) => {
                return Err(StageError::Action {
                    action_type_id: invocation.action_type_id.clone(),
                    source: ActionError::Timeout(timeout),
                });
            }
        };

        tracing::debug!(
            run_id = %event.run_id,
            stage = event.stage,
            action_type = %invocation.action_type_id,
            output = %output,
            "action succeeded"
        );

        if !self.settings.stage_delay.is_zero() {
            tokio::time::sleep(self.settings.stage_delay).await;
        }

        if loaded.definition.is_last_stage(event.stage) {
            tracing::info!(
                run_id = %event.run_id,
                workflow_id = %loaded.definition.id,
                stages = loaded.definition.actions.len(),
                "workflow run completed"
            );
            return Ok(StageOutcome::Completed);
        }

        let next = event.next_stage();
        publish_event(self.broker.as_ref(), &self.settings.topic, &next).await?;
        Ok(StageOutcome::Advanced { next })
    }

    /// Process one delivery and decide whether its offset may be committed.
    pub async fn process(&self, delivery: &Delivery) -> Disposition {
        let event = match StageEvent::from_bytes(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    partition = delivery.partition,
                    offset = delivery.offset,
                    error = %StageError::Decode(e.to_string()),
                    "dropping stage event"
                );
                return Disposition::Commit;
            }
        };

        match self.handle(&event).await {
            Ok(StageOutcome::Advanced { next }) => {
                tracing::info!(
                    run_id = %event.run_id,
                    stage = event.stage,
                    next_stage = next.stage,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "stage completed"
                );
                Disposition::Commit
            }
            Ok(StageOutcome::Completed) => Disposition::Commit,
            Err(err) => self.on_error(&event, delivery, err).await,
        }
    }

    async fn on_error(&self, event: &StageEvent, delivery: &Delivery, err: StageError) -> Disposition {
        let decision = match err.kind() {
            FailureKind::Transient => {
                tracing::warn!(
                    run_id = %event.run_id,
                    stage = event.stage,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    error = %err,
                    "transient failure, stage will be redelivered"
                );
                return Disposition::Redeliver;
            }
            FailureKind::Drop => {
                tracing::warn!(
                    run_id = %event.run_id,
                    stage = event.stage,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    error = %err,
                    "dropping stage event"
                );
                return Disposition::Commit;
            }
            FailureKind::Retryable => self.settings.retry_policy.decide(event),
            FailureKind::Permanent => self.settings.retry_policy.decide_permanent(),
        };

        tracing::warn!(
            run_id = %event.run_id,
            stage = event.stage,
            attempt = event.attempt,
            partition = delivery.partition,
            offset = delivery.offset,
            error = %err,
            decision = ?decision,
            "stage action failed"
        );

        let published = match decision {
            RetryDecision::Redeliver => return Disposition::Redeliver,
            RetryDecision::Requeue(retry) => {
                publish_event(self.broker.as_ref(), &self.settings.topic, &retry).await
            }
            RetryDecision::DeadLetter => self.dead_letter(event, &err).await,
        };

        match published {
            Ok(()) => Disposition::Commit,
            Err(e) => {
                tracing::warn!(
                    run_id = %event.run_id,
                    stage = event.stage,
                    error = %e,
                    "failed to publish retry, stage will be redelivered"
                );
                Disposition::Redeliver
            }
        }
    }

    async fn dead_letter(&self, event: &StageEvent, err: &StageError) -> Result<(), BrokerError> {
        let letter = DeadLetter {
            event: *event,
            action_type_id: err.action_type_id().map(str::to_string),
            error: err.to_string(),
            failed_at: Utc::now(),
        };
        let payload = serde_json::to_vec(&letter)
            .map_err(|e| BrokerError::Publish(format!("encode dead letter: {e}")))?;
        self.broker
            .publish(
                &self.settings.dead_letter_topic,
                vec![OutgoingMessage {
                    key: event.key(),
                    payload,
                }],
            )
            .await?;

        tracing::error!(
            run_id = %event.run_id,
            stage = event.stage,
            attempt = event.attempt,
            topic = %self.settings.dead_letter_topic,
            "stage dead-lettered"
        );
        Ok(())
    }

    /// Fetch from the committed offset of `partition` and process the batch
    /// in order, committing after each message. Stops at the first message
    /// that must be redelivered.
    pub async fn poll_partition(&self, partition: u32) -> Result<PollOutcome, BrokerError> {
        let deliveries = self
            .broker
            .fetch(
                &self.settings.group_id,
                &self.settings.topic,
                partition,
                self.settings.fetch_max,
            )
            .await?;
        if deliveries.is_empty() {
            return Ok(PollOutcome::Idle);
        }

        let mut processed = 0;
        for delivery in &deliveries {
            match self.process(delivery).await {
                Disposition::Commit => {
                    self.broker
                        .commit(
                            &self.settings.group_id,
                            &self.settings.topic,
                            partition,
                            delivery.offset + 1,
                        )
                        .await?;
                    processed += 1;
                }
                Disposition::Redeliver => return Ok(PollOutcome::Stalled),
            }
        }
        Ok(PollOutcome::Progressed(processed))
    }

    /// Partitions this executor consumes, validated against the topic.
    pub fn assigned_partitions(&self) -> Result<Vec<u32>, BrokerError> {
        let count = self.broker.partition_count(&self.settings.topic);
        match &self.settings.partitions {
            Some(assigned) => {
                for &partition in assigned {
                    check_partition(&self.settings.topic, partition, count)?;
                }
                let mut assigned = assigned.clone();
                assigned.sort_unstable();
                assigned.dedup();
                Ok(assigned)
            }
            None => Ok((0..count).collect()),
        }
    }

    /// Run one worker per assigned partition until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), BrokerError> {
        let partitions = self.assigned_partitions()?;
        tracing::info!(
            topic = %self.settings.topic,
            group_id = %self.settings.group_id,
            partitions = ?partitions,
            "stage executor started"
        );

        let mut workers = JoinSet::new();
        for partition in partitions {
            let executor = Arc::clone(&self);
            let cancel = cancel.clone();
            workers.spawn(async move { executor.run_partition(partition, cancel).await });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "partition worker panicked");
            }
        }

        tracing::info!("stage executor stopped");
        Ok(())
    }

    async fn run_partition(&self, partition: u32, cancel: CancellationToken) {
        tracing::debug!(partition, "partition worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let wait = match self.poll_partition(partition).await {
                Ok(PollOutcome::Progressed(_)) => None,
                Ok(PollOutcome::Idle) => Some(self.settings.poll_interval),
                Ok(PollOutcome::Stalled) => Some(self.settings.retry_backoff),
                Err(e) => {
                    tracing::warn!(partition, error = %e, "partition poll failed");
                    Some(self.settings.retry_backoff)
                }
            };

            if let Some(wait) = wait {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
        tracing::debug!(partition, "partition worker stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::action::box_handler::BoxActionHandler;
    use crate::action::{ActionHandler, ActionOutput};
    use crate::broker::memory::InMemoryBroker;
    use crate::repository::memory::InMemoryRunStore;
    use relayflow_types::workflow::{
        ActionMetadata, ActionSpec, TriggerSpec, WorkflowDefinition, WorkflowRun,
    };
    use serde_json::json;

    const TOPIC: &str = "stage-events";
    const DLQ: &str = "stage-events-dlq";

    // -- handlers ----------------------------------------------------------

    /// Records every invocation.
    #[derive(Clone, Default)]
    struct Recording {
        calls: Arc<Mutex<Vec<ActionInvocation>>>,
    }

    impl Recording {
        fn calls(&self) -> Vec<ActionInvocation> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ActionHandler for Recording {
        async fn execute(&self, invocation: &ActionInvocation) -> Result<ActionOutput, ActionError> {
            self.calls.lock().unwrap().push(invocation.clone());
            Ok(json!({ "ok": true }))
        }
    }

    /// Applies its effect once per idempotency key.
    #[derive(Clone, Default)]
    struct Idempotent {
        applied: Arc<Mutex<HashSet<String>>>,
    }

    impl ActionHandler for Idempotent {
        async fn execute(&self, invocation: &ActionInvocation) -> Result<ActionOutput, ActionError> {
            self.applied
                .lock()
                .unwrap()
                .insert(invocation.idempotency_key.clone());
            Ok(ActionOutput::Null)
        }
    }

    /// Applies its effect on every call.
    #[derive(Clone, Default)]
    struct Counter {
        count: Arc<AtomicU32>,
    }

    impl ActionHandler for Counter {
        async fn execute(&self, _: &ActionInvocation) -> Result<ActionOutput, ActionError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(ActionOutput::Null)
        }
    }

    /// Always fails.
    #[derive(Clone, Default)]
    struct Failing {
        attempts: Arc<Mutex<Vec<u32>>>,
    }

    impl ActionHandler for Failing {
        async fn execute(&self, invocation: &ActionInvocation) -> Result<ActionOutput, ActionError> {
            self.attempts.lock().unwrap().push(invocation.attempt);
            Err(ActionError::Failed("smtp refused".to_string()))
        }
    }

    /// Never finishes in time.
    struct Slow;

    impl ActionHandler for Slow {
        async fn execute(&self, _: &ActionInvocation) -> Result<ActionOutput, ActionError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ActionOutput::Null)
        }
    }

    // -- fixtures ----------------------------------------------------------

    fn definition(action_types: &[&str]) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "test".to_string(),
            trigger: TriggerSpec {
                id: Uuid::now_v7(),
                trigger_type_id: "webhook".to_string(),
                metadata: json!({}),
            },
            actions: action_types
                .iter()
                .enumerate()
                .map(|(i, type_id)| ActionSpec {
                    id: Uuid::now_v7(),
                    action_type_id: type_id.to_string(),
                    sorting_order: i as u32,
                    metadata: ActionMetadata::from([(
                        "email".to_string(),
                        "{{email}}".to_string(),
                    )]),
                })
                .collect(),
        }
    }

    fn settings(max_attempts: u32) -> ExecutorSettings {
        ExecutorSettings {
            topic: TOPIC.to_string(),
            dead_letter_topic: DLQ.to_string(),
            group_id: "executors".to_string(),
            fetch_max: 16,
            poll_interval: Duration::from_millis(5),
            retry_backoff: Duration::from_millis(5),
            handler_timeout: Duration::from_millis(100),
            stage_delay: Duration::ZERO,
            retry_policy: RetryPolicy::from_max_attempts(max_attempts),
            partitions: None,
        }
    }

    struct Harness {
        store: Arc<InMemoryRunStore>,
        broker: Arc<InMemoryBroker>,
        executor: Arc<StageExecutor<InMemoryRunStore, InMemoryBroker>>,
    }

    impl Harness {
        fn new(partitions: u32, registry: ActionRegistry, settings: ExecutorSettings) -> Self {
            let store = Arc::new(InMemoryRunStore::new());
            let broker = Arc::new(InMemoryBroker::new(partitions));
            let executor = Arc::new(StageExecutor::new(
                Arc::clone(&store),
                Arc::clone(&broker),
                Arc::new(registry),
                settings,
            ));
            Self {
                store,
                broker,
                executor,
            }
        }

        fn start_run(&self, def: &WorkflowDefinition, payload: serde_json::Value) -> Uuid {
            self.store.save_workflow(def.clone()).unwrap();
            let run = WorkflowRun {
                id: Uuid::now_v7(),
                workflow_id: def.id,
                trigger_payload: payload,
                created_at: Utc::now(),
            };
            let run_id = run.id;
            self.store.insert_run(run);
            run_id
        }

        async fn publish(&self, event: StageEvent) {
            publish_event(self.broker.as_ref(), TOPIC, &event).await.unwrap();
        }

        /// Poll partition 0 until it is idle.
        async fn drain(&self) {
            for _ in 0..100 {
                if self.executor.poll_partition(0).await.unwrap() == PollOutcome::Idle {
                    return;
                }
            }
            panic!("partition never became idle");
        }

        async fn committed(&self) -> u64 {
            self.broker
                .offsets("executors", TOPIC, 0)
                .await
                .unwrap()
                .committed
        }
    }

    fn registry_with(type_id: &str, handler: BoxActionHandler) -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        registry.register(type_id, handler);
        registry
    }

    // -- tests -------------------------------------------------------------

    #[tokio::test]
    async fn test_n_actions_n_calls_n_minus_one_followups() {
        let recording = Recording::default();
        let h = Harness::new(1, registry_with("email", BoxActionHandler::new(recording.clone())), settings(3));
        let def = definition(&["email", "email", "email"]);
        let run_id = h.start_run(&def, json!({ "email": "a@b.com" }));

        h.publish(StageEvent::first(run_id)).await;
        h.drain().await;

        let calls = recording.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls.iter().map(|c| c.stage).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(calls.iter().all(|c| c.fields["email"] == "a@b.com"));
        assert_eq!(calls[1].idempotency_key, format!("{run_id}:1"));
        assert_eq!(calls[2].action_id, def.actions[2].id);

        // Seed event + two follow-ups
        let events = h.broker.stage_events(TOPIC);
        assert_eq!(events.len(), 3);
        assert_eq!(events.iter().map(|e| e.stage).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(h.committed().await, 3);
    }

    #[tokio::test]
    async fn test_handle_reports_outcome() {
        let recording = Recording::default();
        let h = Harness::new(1, registry_with("email", BoxActionHandler::new(recording)), settings(3));
        let run_id = h.start_run(&definition(&["email", "email"]), json!({}));

        let first = StageEvent::first(run_id);
        let outcome = h.executor.handle(&first).await.unwrap();
        assert_eq!(outcome, StageOutcome::Advanced { next: first.next_stage() });

        let outcome = h.executor.handle(&first.next_stage()).await.unwrap();
        assert_eq!(outcome, StageOutcome::Completed);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_idempotent_vs_non_idempotent() {
        let idempotent = Idempotent::default();
        let counter = Counter::default();
        let mut registry = ActionRegistry::new();
        registry.register("idempotent", BoxActionHandler::new(idempotent.clone()));
        registry.register("counter", BoxActionHandler::new(counter.clone()));
        let h = Harness::new(1, registry, settings(3));

        let idem_run = h.start_run(&definition(&["idempotent"]), json!({}));
        let count_run = h.start_run(&definition(&["counter"]), json!({}));

        // Same stage delivered twice (relay crashed between ack and delete)
        for _ in 0..2 {
            h.publish(StageEvent::first(idem_run)).await;
            h.publish(StageEvent::first(count_run)).await;
        }
        h.drain().await;

        assert_eq!(idempotent.applied.lock().unwrap().len(), 1);
        assert_eq!(counter.count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_out_of_range_stage_dropped() {
        let recording = Recording::default();
        let h = Harness::new(1, registry_with("email", BoxActionHandler::new(recording.clone())), settings(3));
        let run_id = h.start_run(&definition(&["email", "email"]), json!({}));

        h.publish(StageEvent {
            run_id,
            stage: 99,
            attempt: 0,
        })
        .await;
        h.drain().await;

        assert!(recording.calls().is_empty());
        assert_eq!(h.broker.messages(TOPIC).len(), 1);
        assert!(h.broker.messages(DLQ).is_empty());
        assert_eq!(h.committed().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_run_and_garbage_dropped() {
        let h = Harness::new(1, ActionRegistry::new(), settings(3));
        h.publish(StageEvent::first(Uuid::now_v7())).await;
        h.broker
            .publish(
                TOPIC,
                vec![OutgoingMessage {
                    key: "k".to_string(),
                    payload: b"{not json".to_vec(),
                }],
            )
            .await
            .unwrap();

        assert_eq!(h.executor.poll_partition(0).await.unwrap(), PollOutcome::Progressed(2));
        assert_eq!(h.committed().await, 2);
    }

    #[tokio::test]
    async fn test_failing_action_requeued_then_dead_lettered() {
        let failing = Failing::default();
        let h = Harness::new(1, registry_with("email", BoxActionHandler::new(failing.clone())), settings(3));
        let run_id = h.start_run(&definition(&["email", "email"]), json!({}));

        h.publish(StageEvent::first(run_id)).await;
        h.drain().await;

        assert_eq!(*failing.attempts.lock().unwrap(), vec![0, 1, 2]);

        // First delivery + two re-queues, no stage 1
        let events = h.broker.stage_events(TOPIC);
        assert_eq!(events.iter().map(|e| (e.stage, e.attempt)).collect::<Vec<_>>(), vec![(0, 0), (0, 1), (0, 2)]);

        let dead = h.broker.messages(DLQ);
        assert_eq!(dead.len(), 1);
        let letter: DeadLetter = serde_json::from_slice(&dead[0].payload).unwrap();
        assert_eq!(letter.event.run_id, run_id);
        assert_eq!(letter.event.attempt, 2);
        assert_eq!(letter.action_type_id.as_deref(), Some("email"));
        assert!(letter.error.contains("smtp refused"));
        assert_eq!(h.committed().await, 3);
    }

    #[tokio::test]
    async fn test_redeliver_policy_never_commits_failure() {
        let failing = Failing::default();
        let h = Harness::new(1, registry_with("email", BoxActionHandler::new(failing.clone())), settings(0));
        let run_id = h.start_run(&definition(&["email"]), json!({}));
        h.publish(StageEvent::first(run_id)).await;

        for _ in 0..3 {
            assert_eq!(h.executor.poll_partition(0).await.unwrap(), PollOutcome::Stalled);
        }
        assert_eq!(failing.attempts.lock().unwrap().len(), 3);
        assert_eq!(h.committed().await, 0);
        assert_eq!(h.broker.messages(TOPIC).len(), 1);
        assert!(h.broker.messages(DLQ).is_empty());
    }

    #[tokio::test]
    async fn test_handler_timeout_is_failure() {
        let h = Harness::new(1, registry_with("slow", BoxActionHandler::new(Slow)), settings(1));
        let run_id = h.start_run(&definition(&["slow", "slow"]), json!({}));

        let err = h.executor.handle(&StageEvent::first(run_id)).await.unwrap_err();
        assert!(matches!(
            err,
            StageError::Action {
                source: ActionError::Timeout(_),
                ..
            }
        ));

        h.publish(StageEvent::first(run_id)).await;
        h.drain().await;
        assert_eq!(h.broker.messages(DLQ).len(), 1);
        assert_eq!(h.broker.stage_events(TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_action_type_dead_lettered() {
        let h = Harness::new(1, ActionRegistry::new(), settings(3));
        let run_id = h.start_run(&definition(&["send-sol"]), json!({}));
        h.publish(StageEvent::first(run_id)).await;
        h.drain().await;

        let dead = h.broker.messages(DLQ);
        assert_eq!(dead.len(), 1);
        let letter: DeadLetter = serde_json::from_slice(&dead[0].payload).unwrap();
        assert_eq!(letter.action_type_id.as_deref(), Some("send-sol"));
        assert_eq!(h.broker.stage_events(TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn test_store_outage_leaves_offset_uncommitted() {
        let recording = Recording::default();
        let h = Harness::new(1, registry_with("email", BoxActionHandler::new(recording.clone())), settings(3));
        let run_id = h.start_run(&definition(&["email"]), json!({}));
        h.publish(StageEvent::first(run_id)).await;

        h.store.set_available(false);
        assert_eq!(h.executor.poll_partition(0).await.unwrap(), PollOutcome::Stalled);
        assert_eq!(h.committed().await, 0);
        assert!(recording.calls().is_empty());

        h.store.set_available(true);
        assert_eq!(h.executor.poll_partition(0).await.unwrap(), PollOutcome::Progressed(1));
        assert_eq!(recording.calls().len(), 1);
        assert_eq!(h.committed().await, 1);
    }

    #[tokio::test]
    async fn test_broker_outage_on_followup_redelivers() {
        let recording = Recording::default();
        let h = Harness::new(1, registry_with("email", BoxActionHandler::new(recording.clone())), settings(3));
        let run_id = h.start_run(&definition(&["email", "email"]), json!({}));
        h.publish(StageEvent::first(run_id)).await;

        h.broker.fail_next_publish_after(0);
        assert_eq!(h.executor.poll_partition(0).await.unwrap(), PollOutcome::Stalled);
        assert_eq!(h.committed().await, 0);

        // Redelivered: the action runs again (at-least-once), then the run advances
        h.drain().await;
        let stages: Vec<u32> = recording.calls().iter().map(|c| c.stage).collect();
        assert_eq!(stages, vec![0, 0, 1]);
    }

    #[tokio::test]
    async fn test_assigned_partitions_validated() {
        let mut s = settings(3);
        s.partitions = Some(vec![3, 1, 1]);
        let h = Harness::new(4, ActionRegistry::new(), s);
        assert_eq!(h.executor.assigned_partitions().unwrap(), vec![1, 3]);

        let mut s = settings(3);
        s.partitions = Some(vec![4]);
        let h = Harness::new(4, ActionRegistry::new(), s);
        assert!(matches!(
            h.executor.assigned_partitions(),
            Err(BrokerError::InvalidPartition { .. })
        ));

        let h = Harness::new(2, ActionRegistry::new(), settings(3));
        assert_eq!(h.executor.assigned_partitions().unwrap(), vec![0, 1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stage_order_across_partitions() {
        let recording = Recording::default();
        let h = Harness::new(4, registry_with("email", BoxActionHandler::new(recording.clone())), settings(3));
        let def = definition(&["email", "email", "email"]);

        let runs: Vec<Uuid> = (0..20).map(|_| h.start_run(&def, json!({}))).collect();
        for run_id in &runs {
            h.publish(StageEvent::first(*run_id)).await;
        }

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(Arc::clone(&h.executor).run(cancel.clone()));

        for _ in 0..400 {
            if recording.calls().len() >= runs.len() * 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        worker.await.unwrap().unwrap();

        let mut per_run: HashMap<Uuid, Vec<u32>> = HashMap::new();
        for call in recording.calls() {
            per_run.entry(call.run_id).or_default().push(call.stage);
        }
        assert_eq!(per_run.len(), runs.len());
        for stages in per_run.values() {
            assert_eq!(stages, &vec![0, 1, 2]);
        }
    }
}
