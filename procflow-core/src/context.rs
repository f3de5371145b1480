//! The command context: one transactional unit of work.
//!
//! A context owns the entity cache, the agenda, the queued domain events and
//! the close-listener lists for exactly one top-level command. It is created
//! by the command executor, driven on a single logical thread, and closed
//! exactly once — commit when no failure was recorded, rollback otherwise.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use crate::agenda::{Agenda, Operation};
use crate::cache::EntityCache;
use crate::command::Command;
use crate::error::EngineError;
use crate::events::{EventDispatcher, FlowEvent};
use crate::model::ProcessDefinition;
use crate::operations;
use crate::store::{ChangeSet, RuntimeStore};
use crate::types::{
    ExecutionEntity, ExecutionId, InstanceId, JobEntity, JobId, JobKind, MigrationContext,
    VariableValue,
};

/// Lifecycle phase a close listener is registered for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClosePhase {
    /// Before the flush, on the commit path only.
    Closing,
    /// After a successful commit.
    Closed,
    /// After the rollback path discarded the unit of work.
    CloseFailed,
}

/// Callback run during context close. Listeners run in registration order;
/// listeners registered while the closing pass is underway still run in the
/// same pass.
pub trait CloseListener: Send {
    fn on_close(&mut self, context: &mut CommandContext);
}

impl<F: FnMut(&mut CommandContext) + Send> CloseListener for F {
    fn on_close(&mut self, context: &mut CommandContext) {
        self(context)
    }
}

pub struct CommandContext {
    store: Arc<dyn RuntimeStore>,
    dispatchers: Arc<Vec<Box<dyn EventDispatcher>>>,
    cache: EntityCache,
    agenda: Agenda,
    events: Vec<FlowEvent>,
    close_listeners: Vec<(ClosePhase, Box<dyn CloseListener>)>,
    /// Variables written during this command, per instance — consumed by the
    /// variable-listener evaluation operation.
    touched_variables: BTreeMap<InstanceId, BTreeSet<String>>,
    /// Set when an operation failed; forces the rollback path at close.
    failure: Option<String>,
    closed: bool,
    async_history: bool,
}

impl CommandContext {
    pub(crate) fn new(
        store: Arc<dyn RuntimeStore>,
        dispatchers: Arc<Vec<Box<dyn EventDispatcher>>>,
        async_history: bool,
    ) -> Self {
        Self {
            store,
            dispatchers,
            cache: EntityCache::new(),
            agenda: Agenda::new(),
            events: Vec::new(),
            close_listeners: Vec::new(),
            touched_variables: BTreeMap::new(),
            failure: None,
            closed: false,
            async_history,
        }
    }

    // ── Agenda access ──

    pub fn agenda(&self) -> &Agenda {
        &self.agenda
    }

    pub(crate) fn take_next_operation(&mut self) -> Option<Operation> {
        self.agenda.next_operation()
    }

    // ── Nested commands ──

    /// Run a command inside this already-open context: same transaction,
    /// same agenda. Operations it plans are drained by the enclosing
    /// executor loop. A command that needs its own transaction must go back
    /// through a `CommandExecutor` handle instead.
    pub async fn run_command<C: Command>(&mut self, command: &C) -> Result<C::Output, EngineError> {
        command.execute(self).await
    }

    // ── Definitions ──

    pub async fn definition(&mut self, id: &str) -> Result<Arc<ProcessDefinition>, EngineError> {
        if let Some(definition) = self.cache.definition(id) {
            return Ok(definition);
        }
        let definition = self
            .store
            .load_definition(id)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(id.to_string()))?;
        self.cache.put_definition(definition.clone());
        Ok(definition)
    }

    pub fn deploy_definition(&mut self, definition: ProcessDefinition) {
        debug!(definition = %definition.id, "deploying process definition");
        self.cache.deploy_definition(definition);
    }

    // ── Executions ──

    pub async fn execution(&mut self, id: ExecutionId) -> Result<ExecutionEntity, EngineError> {
        if let Some(entity) = self.cache.execution(id) {
            return Ok(entity.clone());
        }
        if self.cache.contains_execution(id) {
            // Present but removed within this command.
            return Err(EngineError::ExecutionNotFound(id));
        }
        let entity = self
            .store
            .load_execution(id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(id))?;
        self.cache.put_loaded_execution(entity.clone());
        Ok(entity)
    }

    pub fn insert_execution(&mut self, entity: ExecutionEntity) {
        self.cache.insert_execution(entity);
    }

    pub fn update_execution(&mut self, entity: ExecutionEntity) {
        self.cache.update_execution(entity);
    }

    pub fn remove_execution(&mut self, id: ExecutionId) {
        self.cache.remove_execution(id);
    }

    /// All live executions of an instance, cache overlaid over the store.
    pub async fn executions_for_instance(
        &mut self,
        instance_id: InstanceId,
    ) -> Result<Vec<ExecutionEntity>, EngineError> {
        let stored = self.store.executions_for_instance(instance_id).await?;
        for entity in stored {
            if !self.cache.contains_execution(entity.id) {
                self.cache.put_loaded_execution(entity);
            }
        }
        Ok(self.cache.executions_for_instance(instance_id))
    }

    // ── Variables ──

    /// Write a variable on an execution, record the domain event, and note
    /// the name for variable-listener evaluation.
    pub async fn set_variable(
        &mut self,
        execution_id: ExecutionId,
        name: &str,
        value: VariableValue,
    ) -> Result<(), EngineError> {
        let mut execution = self.execution(execution_id).await?;
        execution.variables.insert(name.to_string(), value.clone());
        let instance_id = execution.process_instance_id;
        self.update_execution(execution);
        self.touched_variables
            .entry(instance_id)
            .or_default()
            .insert(name.to_string());
        self.add_event(FlowEvent::VariableUpdated {
            instance_id,
            execution_id,
            name: name.to_string(),
            value,
        });
        Ok(())
    }

    /// Resolve a variable on the execution or, failing that, up the parent
    /// chain to the process instance root.
    pub async fn resolve_variable(
        &mut self,
        execution_id: ExecutionId,
        name: &str,
    ) -> Result<Option<VariableValue>, EngineError> {
        let mut current = Some(execution_id);
        while let Some(id) = current {
            let execution = self.execution(id).await?;
            if let Some(value) = execution.variables.get(name) {
                return Ok(Some(value.clone()));
            }
            current = execution.parent_id;
        }
        Ok(None)
    }

    pub(crate) fn variables_touched(&self, instance_id: InstanceId) -> BTreeSet<String> {
        self.touched_variables
            .get(&instance_id)
            .cloned()
            .unwrap_or_default()
    }

    // ── Jobs ──

    pub async fn job(&mut self, id: JobId) -> Result<JobEntity, EngineError> {
        if let Some(job) = self.cache.job(id) {
            return Ok(job.clone());
        }
        let job = self
            .store
            .load_job(id)
            .await?
            .ok_or(EngineError::JobNotFound(id))?;
        self.cache.put_loaded_job(job.clone());
        Ok(job)
    }

    /// Persist a job and record the scheduling event.
    pub fn schedule_job(&mut self, job: JobEntity) {
        if let Some(instance_id) = job.process_instance_id {
            self.add_event(FlowEvent::JobScheduled {
                instance_id,
                job_id: job.id,
                execution_id: job.execution_id,
                kind: job.kind.as_str().to_string(),
            });
        }
        self.cache.insert_job(job);
    }

    pub fn remove_job(&mut self, id: JobId) {
        self.cache.remove_job(id);
    }

    // ── Events ──

    pub fn add_event(&mut self, event: FlowEvent) {
        self.events.push(event);
    }

    /// Events queued so far in this command, in enqueue order. They are not
    /// dispatched until the context commits.
    pub fn pending_events(&self) -> &[FlowEvent] {
        &self.events
    }

    // ── Convenience planners ──

    pub fn plan_continue_process(&mut self, execution_id: ExecutionId) {
        self.agenda.plan(Operation::ContinueProcess {
            execution_id,
            forced_synchronous: false,
            migration_context: None,
        });
    }

    pub fn plan_continue_process_forced_synchronous(&mut self, execution_id: ExecutionId) {
        self.agenda.plan(Operation::ContinueProcess {
            execution_id,
            forced_synchronous: true,
            migration_context: None,
        });
    }

    pub fn plan_continue_process_with_migration(
        &mut self,
        execution_id: ExecutionId,
        migration_context: MigrationContext,
    ) {
        self.agenda.plan(Operation::ContinueProcess {
            execution_id,
            forced_synchronous: true,
            migration_context: Some(migration_context),
        });
    }

    pub fn plan_continue_multi_instance(&mut self, execution_id: ExecutionId, loop_counter: u32) {
        self.agenda.plan(Operation::ContinueMultiInstance {
            execution_id,
            loop_counter,
        });
    }

    pub fn plan_take_outgoing_sequence_flows(
        &mut self,
        execution_id: ExecutionId,
        evaluate_conditions: bool,
    ) {
        self.agenda.plan(Operation::TakeOutgoingSequenceFlows {
            execution_id,
            evaluate_conditions,
        });
    }

    pub fn plan_trigger_execution(&mut self, execution_id: ExecutionId, trigger_async: bool) {
        self.agenda.plan(Operation::TriggerExecution {
            execution_id,
            trigger_async,
        });
    }

    pub fn plan_end_execution(&mut self, execution_id: ExecutionId) {
        self.agenda.plan(Operation::EndExecution { execution_id });
    }

    pub fn plan_destroy_scope(&mut self, execution_id: ExecutionId) {
        self.agenda.plan(Operation::DestroyScope { execution_id });
    }

    pub fn plan_execute_inactive_behaviors(&mut self, process_instance_id: InstanceId) {
        self.agenda
            .plan(Operation::ExecuteInactiveBehaviors { process_instance_id });
    }

    pub fn plan_evaluate_conditional_events(&mut self, process_instance_id: InstanceId) {
        self.agenda
            .plan(Operation::EvaluateConditionalEvents { process_instance_id });
    }

    pub fn plan_evaluate_variable_listener_events(&mut self, process_instance_id: InstanceId) {
        self.agenda
            .plan(Operation::EvaluateVariableListenerEvents { process_instance_id });
    }

    // ── Synchronous bypass ──

    /// Run a continue-process operation immediately, bypassing the queue.
    /// Reserved for narrow correctness-critical sequences (multi-instance
    /// bookkeeping); everything else must queue.
    pub async fn continue_process_synchronously(
        &mut self,
        execution_id: ExecutionId,
    ) -> Result<(), EngineError> {
        Box::pin(operations::run(
            self,
            Operation::ContinueProcess {
                execution_id,
                forced_synchronous: true,
                migration_context: None,
            },
        ))
        .await
    }

    /// Run an end-execution operation immediately, bypassing the queue. For
    /// behaviors that must tear an execution down before anything already
    /// queued runs.
    pub async fn end_execution_synchronously(
        &mut self,
        execution_id: ExecutionId,
    ) -> Result<(), EngineError> {
        Box::pin(operations::run(self, Operation::EndExecution { execution_id })).await
    }

    // ── Close lifecycle ──

    pub fn add_close_listener(&mut self, phase: ClosePhase, listener: Box<dyn CloseListener>) {
        self.close_listeners.push((phase, listener));
    }

    pub(crate) fn record_failure(&mut self, reason: String) {
        if self.failure.is_none() {
            self.failure = Some(reason);
        }
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Schedule per-instance history jobs capturing this command's events.
    fn capture_history_jobs(events: &[FlowEvent], changes: &mut ChangeSet) {
        let mut per_instance: BTreeMap<InstanceId, Vec<&FlowEvent>> = BTreeMap::new();
        for event in events {
            per_instance.entry(event.instance_id()).or_default().push(event);
        }
        for (instance_id, events) in per_instance {
            let payload = match serde_json::to_value(&events) {
                Ok(payload) => payload,
                Err(error) => {
                    // Events are plain serde structs; failure here means a bug,
                    // not a runtime condition worth failing the commit for.
                    tracing::warn!(%error, "failed to encode history payload");
                    continue;
                }
            };
            changes.job_writes.push(JobEntity::new(
                JobKind::History { payload },
                None,
                Some(instance_id),
                None,
            ));
        }
    }

    fn run_close_phase(&mut self, phase: ClosePhase) {
        // Listeners may register more listeners for the same phase while
        // running; keep draining until none are left.
        loop {
            let mut ready = Vec::new();
            let mut remaining = Vec::new();
            for entry in std::mem::take(&mut self.close_listeners) {
                if entry.0 == phase {
                    ready.push(entry.1);
                } else {
                    remaining.push(entry);
                }
            }
            self.close_listeners = remaining;
            if ready.is_empty() {
                break;
            }
            for mut listener in ready {
                listener.on_close(self);
            }
        }
    }

    /// Close the unit of work: flush + commit + dispatch on the success
    /// path, discard everything on the failure path. Exactly-once — a
    /// second close is a programming error and fails fast.
    pub(crate) async fn close(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::ContextClosed);
        }

        if self.failure.is_some() {
            // Rollback path: nothing is flushed, nothing is dispatched.
            self.closed = true;
            self.run_close_phase(ClosePhase::CloseFailed);
            debug!(reason = self.failure.as_deref(), "command context rolled back");
            return Ok(());
        }

        self.run_close_phase(ClosePhase::Closing);

        let mut changes = std::mem::take(&mut self.cache).flush();
        let events = std::mem::take(&mut self.events);
        if self.async_history && !events.is_empty() {
            Self::capture_history_jobs(&events, &mut changes);
        }
        changes.events = events.clone();

        match self.store.apply(changes).await {
            Ok(()) => {
                self.closed = true;
                for event in &events {
                    for dispatcher in self.dispatchers.iter() {
                        dispatcher.on_event(event);
                    }
                }
                self.run_close_phase(ClosePhase::Closed);
                Ok(())
            }
            Err(error) => {
                self.closed = true;
                self.failure = Some(error.to_string());
                self.run_close_phase(ClosePhase::CloseFailed);
                Err(error.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use crate::types::ExecutionEntity;
    use std::sync::Mutex;

    fn context() -> (CommandContext, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let ctx = CommandContext::new(store.clone(), Arc::new(Vec::new()), false);
        (ctx, store)
    }

    #[tokio::test]
    async fn second_close_is_rejected() {
        let (mut ctx, _store) = context();
        ctx.close().await.unwrap();
        assert!(ctx.is_closed());
        assert!(matches!(
            ctx.close().await.unwrap_err(),
            EngineError::ContextClosed
        ));
    }

    #[tokio::test]
    async fn commit_runs_closing_and_closed_listeners_in_order() {
        let (mut ctx, _store) = context();
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::default();

        for (phase, tag) in [
            (ClosePhase::Closed, "closed"),
            (ClosePhase::Closing, "closing"),
            (ClosePhase::CloseFailed, "failed"),
        ] {
            let log = log.clone();
            ctx.add_close_listener(
                phase,
                Box::new(move |_ctx: &mut CommandContext| log.lock().unwrap().push(tag)),
            );
        }

        ctx.close().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["closing", "closed"]);
    }

    #[tokio::test]
    async fn rollback_runs_only_close_failed_listeners_and_flushes_nothing() {
        let (mut ctx, store) = context();
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        for (phase, tag) in [
            (ClosePhase::Closing, "closing"),
            (ClosePhase::Closed, "closed"),
            (ClosePhase::CloseFailed, "failed"),
        ] {
            let log = log.clone();
            ctx.add_close_listener(
                phase,
                Box::new(move |_ctx: &mut CommandContext| log.lock().unwrap().push(tag)),
            );
        }

        ctx.insert_execution(ExecutionEntity::new_process_instance("p:1", None));
        ctx.record_failure("simulated".into());
        ctx.close().await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["failed"]);
        assert_eq!(store.execution_count().await, 0);
    }

    #[tokio::test]
    async fn synchronous_end_runs_without_draining_the_queue() {
        let (mut ctx, _store) = context();
        let root = ExecutionEntity::new_process_instance("p:1", None);
        let child = root.new_child("end");
        let child_id = child.id;
        ctx.insert_execution(root);
        ctx.insert_execution(child);

        ctx.end_execution_synchronously(child_id).await.unwrap();

        // The execution ended inline; only the follow-up teardown is queued.
        assert!(ctx.execution(child_id).await.is_err());
        let kinds: Vec<_> = ctx.agenda().pending().map(|op| op.kind()).collect();
        assert_eq!(kinds, vec!["destroy-scope"]);
    }

    #[tokio::test]
    async fn listeners_registered_during_close_still_run() {
        let (mut ctx, _store) = context();
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        let inner_log = log.clone();
        let outer_log = log.clone();
        ctx.add_close_listener(
            ClosePhase::Closed,
            Box::new(move |ctx: &mut CommandContext| {
                outer_log.lock().unwrap().push("first");
                let log = inner_log.clone();
                ctx.add_close_listener(
                    ClosePhase::Closed,
                    Box::new(move |_ctx: &mut CommandContext| {
                        log.lock().unwrap().push("late")
                    }),
                );
            }),
        );

        ctx.close().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first", "late"]);
    }
}
