//! In-memory `RunStore` for tests and embedded single-process use.
//!
//! Mirrors the SQLite store's semantics: definitions are validated on save,
//! a run and its outbox entry are created together, and outbox entries are
//! returned oldest first.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use relayflow_types::error::RepositoryError;
use relayflow_types::workflow::{OutboxEntry, RunWithDefinition, WorkflowDefinition, WorkflowRun};
use uuid::Uuid;

use super::run_store::RunStore;

/// `RunStore` backed by process memory.
pub struct InMemoryRunStore {
    definitions: DashMap<Uuid, WorkflowDefinition>,
    runs: DashMap<Uuid, WorkflowRun>,
    outbox: Mutex<Vec<OutboxEntry>>,
    available: AtomicBool,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self {
            definitions: DashMap::new(),
            runs: DashMap::new(),
            outbox: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Register a workflow definition after validating it.
    pub fn save_workflow(&self, def: WorkflowDefinition) -> Result<(), RepositoryError> {
        def.validate()
            .map_err(|e| RepositoryError::Conflict(e.to_string()))?;
        self.definitions.insert(def.id, def);
        Ok(())
    }

    /// Create a run and its outbox entry in one step (ingestion contract).
    pub fn create_run_with_outbox(
        &self,
        workflow_id: Uuid,
        trigger_payload: serde_json::Value,
    ) -> Result<WorkflowRun, RepositoryError> {
        self.check_available()?;
        if !self.definitions.contains_key(&workflow_id) {
            return Err(RepositoryError::NotFound);
        }

        let run = WorkflowRun {
            id: Uuid::now_v7(),
            workflow_id,
            trigger_payload,
            created_at: Utc::now(),
        };
        let entry = OutboxEntry {
            id: Uuid::now_v7(),
            run_id: run.id,
            created_at: run.created_at,
        };

        let mut outbox = self.lock_outbox()?;
        self.runs.insert(run.id, run.clone());
        outbox.push(entry);
        Ok(run)
    }

    /// Insert a run without an outbox entry (simulates a run whose first
    /// event was already relayed).
    pub fn insert_run(&self, run: WorkflowRun) {
        self.runs.insert(run.id, run);
    }

    /// Snapshot of the pending outbox entries.
    pub fn pending(&self) -> Vec<OutboxEntry> {
        self.outbox
            .lock()
            .map(|outbox| outbox.clone())
            .unwrap_or_default()
    }

    /// Toggle simulated store availability. While unavailable every
    /// operation fails with `RepositoryError::Connection`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RepositoryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RepositoryError::Connection)
        }
    }

    fn lock_outbox(&self) -> Result<std::sync::MutexGuard<'_, Vec<OutboxEntry>>, RepositoryError> {
        self.outbox
            .lock()
            .map_err(|_| RepositoryError::Query("outbox lock poisoned".to_string()))
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStore for InMemoryRunStore {
    async fn fetch_pending_outbox(&self, limit: u32) -> Result<Vec<OutboxEntry>, RepositoryError> {
        self.check_available()?;
        let outbox = self.lock_outbox()?;
        let mut entries = outbox.clone();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn delete_pending(&self, ids: &[Uuid]) -> Result<u64, RepositoryError> {
        self.check_available()?;
        let mut outbox = self.lock_outbox()?;
        let before = outbox.len();
        outbox.retain(|entry| !ids.contains(&entry.id));
        Ok((before - outbox.len()) as u64)
    }

    async fn load_run_with_definition(
        &self,
        run_id: &Uuid,
    ) -> Result<Option<RunWithDefinition>, RepositoryError> {
        self.check_available()?;
        let Some(run) = self.runs.get(run_id).map(|r| r.value().clone()) else {
            return Ok(None);
        };
        let Some(definition) = self
            .definitions
            .get(&run.workflow_id)
            .map(|d| d.value().clone())
        else {
            return Ok(None);
        };
        Ok(Some(RunWithDefinition { run, definition }))
    }

    async fn count_pending_outbox(&self) -> Result<u64, RepositoryError> {
        self.check_available()?;
        Ok(self.lock_outbox()?.len() as u64)
    }
}
