use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::events::FlowEvent;
use crate::model::ProcessDefinition;
use crate::types::{ExecutionEntity, ExecutionId, InstanceId, JobEntity, JobId};

/// Store-level failures. `Conflict` is the optimistic-lock signal the
/// external retry layer keys on; everything else flows through the anyhow
/// backend channel.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("revision conflict on execution {0}")]
    Conflict(ExecutionId),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

// ─── Change set ───────────────────────────────────────────────

/// A revision-checked execution write. `expected_revision` is None for
/// inserts; for updates it must match the stored revision or the whole
/// change set is rejected.
#[derive(Clone, Debug)]
pub struct ExecutionWrite {
    pub expected_revision: Option<u32>,
    pub entity: ExecutionEntity,
}

#[derive(Clone, Debug)]
pub struct ExecutionDelete {
    pub id: ExecutionId,
    pub expected_revision: u32,
}

/// Everything one command wants persisted, applied atomically — the store
/// either commits all of it or none of it.
#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    pub definitions: Vec<ProcessDefinition>,
    pub execution_writes: Vec<ExecutionWrite>,
    pub execution_deletes: Vec<ExecutionDelete>,
    pub job_writes: Vec<JobEntity>,
    pub job_deletes: Vec<JobId>,
    /// Appended to the per-instance event log in order.
    pub events: Vec<FlowEvent>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
            && self.execution_writes.is_empty()
            && self.execution_deletes.is_empty()
            && self.job_writes.is_empty()
            && self.job_deletes.is_empty()
            && self.events.is_empty()
    }
}

// ─── Store trait ──────────────────────────────────────────────

/// Persistence boundary for all runtime state. The command core operates
/// exclusively through this trait, enabling pluggable backends (MemoryStore
/// here, a database in production).
///
/// Reads are point-in-time snapshots; the single write path is
/// [`RuntimeStore::apply`].
#[async_trait]
pub trait RuntimeStore: Send + Sync {
    // ── Definitions ──

    async fn load_definition(&self, id: &str)
        -> Result<Option<Arc<ProcessDefinition>>, StoreError>;

    // ── Executions ──

    async fn load_execution(&self, id: ExecutionId)
        -> Result<Option<ExecutionEntity>, StoreError>;

    async fn executions_for_instance(
        &self,
        instance_id: InstanceId,
    ) -> Result<Vec<ExecutionEntity>, StoreError>;

    // ── Jobs ──

    async fn load_job(&self, id: JobId) -> Result<Option<JobEntity>, StoreError>;

    /// Jobs ready to run at `now`, oldest first. Lock/visibility timeouts
    /// are the external job executor's concern, not the store's.
    async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<JobEntity>, StoreError>;

    // ── Event log (append-only, per instance) ──

    async fn read_events(
        &self,
        instance_id: InstanceId,
        from_seq: u64,
    ) -> Result<Vec<(u64, FlowEvent)>, StoreError>;

    // ── Commit ──

    /// Atomically apply one command's change set. Revision checks on
    /// execution writes/deletes reject the entire set on conflict.
    async fn apply(&self, changes: ChangeSet) -> Result<(), StoreError>;
}
