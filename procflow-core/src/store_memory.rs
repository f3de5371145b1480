//! In-memory [`RuntimeStore`] backend. One mutex around the whole state
//! makes `apply` trivially atomic; good enough for tests and embedding.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::events::FlowEvent;
use crate::model::ProcessDefinition;
use crate::store::{ChangeSet, RuntimeStore, StoreError};
use crate::types::{ExecutionEntity, ExecutionId, InstanceId, JobEntity, JobId};

#[derive(Default)]
struct Inner {
    definitions: BTreeMap<String, Arc<ProcessDefinition>>,
    executions: BTreeMap<ExecutionId, ExecutionEntity>,
    jobs: BTreeMap<JobId, JobEntity>,
    events: BTreeMap<InstanceId, Vec<(u64, FlowEvent)>>,
    next_seq: BTreeMap<InstanceId, u64>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of persisted executions — test helper.
    pub async fn execution_count(&self) -> usize {
        self.inner.lock().await.executions.len()
    }

    /// Total number of persisted jobs — test helper.
    pub async fn job_count(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }
}

#[async_trait]
impl RuntimeStore for MemoryStore {
    async fn load_definition(
        &self,
        id: &str,
    ) -> Result<Option<Arc<ProcessDefinition>>, StoreError> {
        Ok(self.inner.lock().await.definitions.get(id).cloned())
    }

    async fn load_execution(
        &self,
        id: ExecutionId,
    ) -> Result<Option<ExecutionEntity>, StoreError> {
        Ok(self.inner.lock().await.executions.get(&id).cloned())
    }

    async fn executions_for_instance(
        &self,
        instance_id: InstanceId,
    ) -> Result<Vec<ExecutionEntity>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .executions
            .values()
            .filter(|e| e.process_instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn load_job(&self, id: JobId) -> Result<Option<JobEntity>, StoreError> {
        Ok(self.inner.lock().await.jobs.get(&id).cloned())
    }

    async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<JobEntity>, StoreError> {
        let inner = self.inner.lock().await;
        let mut due: Vec<JobEntity> = inner
            .jobs
            .values()
            .filter(|j| j.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|j| j.created_at);
        due.truncate(max);
        Ok(due)
    }

    async fn read_events(
        &self,
        instance_id: InstanceId,
        from_seq: u64,
    ) -> Result<Vec<(u64, FlowEvent)>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .events
            .get(&instance_id)
            .map(|log| {
                log.iter()
                    .filter(|(seq, _)| *seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn apply(&self, changes: ChangeSet) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;

        // Validate every revision check before mutating anything.
        for write in &changes.execution_writes {
            let current = inner.executions.get(&write.entity.id);
            match (write.expected_revision, current) {
                (None, None) => {}
                (Some(expected), Some(stored)) if stored.revision == expected => {}
                _ => return Err(StoreError::Conflict(write.entity.id)),
            }
        }
        for delete in &changes.execution_deletes {
            if let Some(stored) = inner.executions.get(&delete.id) {
                if stored.revision != delete.expected_revision {
                    return Err(StoreError::Conflict(delete.id));
                }
            }
        }

        for definition in changes.definitions {
            inner
                .definitions
                .insert(definition.id.clone(), Arc::new(definition));
        }
        for write in changes.execution_writes {
            let mut entity = write.entity;
            entity.revision += 1;
            inner.executions.insert(entity.id, entity);
        }
        for delete in changes.execution_deletes {
            inner.executions.remove(&delete.id);
        }
        for job in changes.job_writes {
            inner.jobs.insert(job.id, job);
        }
        for id in changes.job_deletes {
            inner.jobs.remove(&id);
        }
        for event in changes.events {
            let instance_id = event.instance_id();
            let seq = inner.next_seq.entry(instance_id).or_insert(1);
            let current = *seq;
            *seq += 1;
            inner
                .events
                .entry(instance_id)
                .or_default()
                .push((current, event));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ExecutionDelete, ExecutionWrite};

    fn write(entity: ExecutionEntity, expected: Option<u32>) -> ChangeSet {
        ChangeSet {
            execution_writes: vec![ExecutionWrite {
                expected_revision: expected,
                entity,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn insert_then_conflicting_update_rejects_whole_set() {
        let store = MemoryStore::new();
        let entity = ExecutionEntity::new_process_instance("p:1", None);
        let id = entity.id;

        store.apply(write(entity.clone(), None)).await.unwrap();
        let stored = store.load_execution(id).await.unwrap().unwrap();
        assert_eq!(stored.revision, 1);

        // Stale revision — must conflict.
        let mut stale = stored.clone();
        stale.revision = 0;
        let err = store.apply(write(stale, Some(0))).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Matching revision commits and bumps.
        store.apply(write(stored.clone(), Some(1))).await.unwrap();
        let stored = store.load_execution(id).await.unwrap().unwrap();
        assert_eq!(stored.revision, 2);
    }

    #[tokio::test]
    async fn conflict_applies_nothing() {
        let store = MemoryStore::new();
        let existing = ExecutionEntity::new_process_instance("p:1", None);
        store.apply(write(existing.clone(), None)).await.unwrap();

        let fresh = ExecutionEntity::new_process_instance("p:1", None);
        let mut stale = store
            .load_execution(existing.id)
            .await
            .unwrap()
            .unwrap();
        stale.revision = 9;

        let changes = ChangeSet {
            execution_writes: vec![
                ExecutionWrite {
                    expected_revision: None,
                    entity: fresh.clone(),
                },
                ExecutionWrite {
                    expected_revision: Some(9),
                    entity: stale,
                },
            ],
            ..Default::default()
        };
        assert!(store.apply(changes).await.is_err());
        // The fresh insert from the same set must not be visible.
        assert!(store.load_execution(fresh.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn event_log_is_sequenced_per_instance() {
        let store = MemoryStore::new();
        let instance_id = uuid::Uuid::now_v7();
        let changes = ChangeSet {
            events: vec![
                FlowEvent::ProcessInstanceStarted {
                    instance_id,
                    definition_id: "p:1".into(),
                },
                FlowEvent::ProcessInstanceCompleted { instance_id },
            ],
            ..Default::default()
        };
        store.apply(changes).await.unwrap();

        let events = store.read_events(instance_id, 1).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, 1);
        assert_eq!(events[1].0, 2);
        let tail = store.read_events(instance_id, 2).await.unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn delete_of_missing_execution_is_idempotent() {
        let store = MemoryStore::new();
        let changes = ChangeSet {
            execution_deletes: vec![ExecutionDelete {
                id: uuid::Uuid::now_v7(),
                expected_revision: 1,
            }],
            ..Default::default()
        };
        store.apply(changes).await.unwrap();
    }
}
