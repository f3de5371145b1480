//! Per-command entity cache.
//!
//! Every entity a command touches lives here until context close, when the
//! dirty subset is flushed into one [`ChangeSet`]. Only one thread ever
//! touches a cache, so there is no interior locking.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::model::ProcessDefinition;
use crate::store::{ChangeSet, ExecutionDelete, ExecutionWrite};
use crate::types::{ExecutionEntity, ExecutionId, InstanceId, JobEntity, JobId};

/// Lifecycle of a cached entity relative to the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CachedState {
    /// Created in this command; not yet persisted.
    Transient,
    /// Loaded from the store, unmodified.
    Clean,
    /// Loaded from the store, modified.
    Dirty,
    /// Persisted entity marked for deletion.
    Removed,
}

#[derive(Clone, Debug)]
struct Cached<T> {
    entity: T,
    state: CachedState,
    /// Store revision at load time; revision check baseline for the flush.
    loaded_revision: u32,
}

#[derive(Default)]
pub(crate) struct EntityCache {
    executions: BTreeMap<ExecutionId, Cached<ExecutionEntity>>,
    jobs: BTreeMap<JobId, Cached<JobEntity>>,
    definitions: BTreeMap<String, Arc<ProcessDefinition>>,
    new_definitions: Vec<ProcessDefinition>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Definitions ──

    pub fn definition(&self, id: &str) -> Option<Arc<ProcessDefinition>> {
        self.definitions.get(id).cloned()
    }

    pub fn put_definition(&mut self, definition: Arc<ProcessDefinition>) {
        self.definitions
            .insert(definition.id.clone(), definition);
    }

    /// Register a definition deployed by this command.
    pub fn deploy_definition(&mut self, definition: ProcessDefinition) {
        let shared = Arc::new(definition.clone());
        self.definitions.insert(definition.id.clone(), shared);
        self.new_definitions.push(definition);
    }

    // ── Executions ──

    pub fn execution(&self, id: ExecutionId) -> Option<&ExecutionEntity> {
        self.executions
            .get(&id)
            .filter(|c| c.state != CachedState::Removed)
            .map(|c| &c.entity)
    }

    pub fn contains_execution(&self, id: ExecutionId) -> bool {
        self.executions.contains_key(&id)
    }

    /// Record an entity freshly loaded from the store.
    pub fn put_loaded_execution(&mut self, entity: ExecutionEntity) {
        let revision = entity.revision;
        self.executions.entry(entity.id).or_insert(Cached {
            entity,
            state: CachedState::Clean,
            loaded_revision: revision,
        });
    }

    pub fn insert_execution(&mut self, entity: ExecutionEntity) {
        self.executions.insert(
            entity.id,
            Cached {
                entity,
                state: CachedState::Transient,
                loaded_revision: 0,
            },
        );
    }

    pub fn update_execution(&mut self, entity: ExecutionEntity) {
        match self.executions.get_mut(&entity.id) {
            Some(cached) => {
                if cached.state == CachedState::Clean {
                    cached.state = CachedState::Dirty;
                }
                cached.entity = entity;
            }
            // Update of an entity never loaded: treat as insert-after-the-fact.
            None => self.insert_execution(entity),
        }
    }

    pub fn remove_execution(&mut self, id: ExecutionId) {
        if let Some(cached) = self.executions.get_mut(&id) {
            if cached.state == CachedState::Transient {
                self.executions.remove(&id);
            } else {
                cached.state = CachedState::Removed;
            }
        }
    }

    /// Cached view of an instance's executions (removed entries excluded).
    /// The caller is responsible for having overlaid store results first.
    pub fn executions_for_instance(&self, instance_id: InstanceId) -> Vec<ExecutionEntity> {
        self.executions
            .values()
            .filter(|c| {
                c.state != CachedState::Removed && c.entity.process_instance_id == instance_id
            })
            .map(|c| c.entity.clone())
            .collect()
    }

    // ── Jobs ──

    pub fn job(&self, id: JobId) -> Option<&JobEntity> {
        self.jobs
            .get(&id)
            .filter(|c| c.state != CachedState::Removed)
            .map(|c| &c.entity)
    }

    pub fn put_loaded_job(&mut self, job: JobEntity) {
        self.jobs.entry(job.id).or_insert(Cached {
            entity: job,
            state: CachedState::Clean,
            loaded_revision: 0,
        });
    }

    pub fn insert_job(&mut self, job: JobEntity) {
        self.jobs.insert(
            job.id,
            Cached {
                entity: job,
                state: CachedState::Transient,
                loaded_revision: 0,
            },
        );
    }

    pub fn remove_job(&mut self, id: JobId) {
        if let Some(cached) = self.jobs.get_mut(&id) {
            if cached.state == CachedState::Transient {
                self.jobs.remove(&id);
            } else {
                cached.state = CachedState::Removed;
            }
        }
    }

    // ── Flush ──

    /// Turn the dirty subset into one atomic change set, consuming the cache.
    pub fn flush(self) -> ChangeSet {
        let mut changes = ChangeSet {
            definitions: self.new_definitions,
            ..Default::default()
        };

        for cached in self.executions.into_values() {
            match cached.state {
                CachedState::Transient => changes.execution_writes.push(ExecutionWrite {
                    expected_revision: None,
                    entity: cached.entity,
                }),
                CachedState::Dirty => changes.execution_writes.push(ExecutionWrite {
                    expected_revision: Some(cached.loaded_revision),
                    entity: cached.entity,
                }),
                CachedState::Removed => changes.execution_deletes.push(ExecutionDelete {
                    id: cached.entity.id,
                    expected_revision: cached.loaded_revision,
                }),
                CachedState::Clean => {}
            }
        }

        for cached in self.jobs.into_values() {
            match cached.state {
                CachedState::Transient => changes.job_writes.push(cached.entity),
                CachedState::Removed => changes.job_deletes.push(cached.entity.id),
                // Jobs are immutable once scheduled; Dirty does not arise.
                CachedState::Dirty | CachedState::Clean => {}
            }
        }

        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_then_removed_leaves_no_trace() {
        let mut cache = EntityCache::new();
        let entity = ExecutionEntity::new_process_instance("p:1", None);
        let id = entity.id;
        cache.insert_execution(entity);
        cache.remove_execution(id);

        let changes = cache.flush();
        assert!(changes.execution_writes.is_empty());
        assert!(changes.execution_deletes.is_empty());
    }

    #[test]
    fn dirty_flush_carries_loaded_revision() {
        let mut cache = EntityCache::new();
        let mut entity = ExecutionEntity::new_process_instance("p:1", None);
        entity.revision = 4;
        let id = entity.id;
        cache.put_loaded_execution(entity);

        let mut updated = cache.execution(id).unwrap().clone();
        updated.active = false;
        cache.update_execution(updated);

        let changes = cache.flush();
        assert_eq!(changes.execution_writes.len(), 1);
        assert_eq!(changes.execution_writes[0].expected_revision, Some(4));
    }

    #[test]
    fn removed_persistent_entity_becomes_delete() {
        let mut cache = EntityCache::new();
        let mut entity = ExecutionEntity::new_process_instance("p:1", None);
        entity.revision = 2;
        let id = entity.id;
        cache.put_loaded_execution(entity);
        cache.remove_execution(id);
        assert!(cache.execution(id).is_none());

        let changes = cache.flush();
        assert_eq!(changes.execution_deletes.len(), 1);
        assert_eq!(changes.execution_deletes[0].expected_revision, 2);
    }

    #[test]
    fn loaded_overlay_does_not_clobber_local_state() {
        let mut cache = EntityCache::new();
        let entity = ExecutionEntity::new_process_instance("p:1", None);
        let id = entity.id;
        cache.insert_execution(entity.clone());

        // A later store load of the same id must not replace the transient copy.
        let mut stale = entity;
        stale.active = false;
        cache.put_loaded_execution(stale);
        assert!(cache.execution(id).unwrap().active);
    }
}
