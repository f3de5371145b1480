//! Engine facade: wires a store, event dispatchers and operation listeners
//! into a command executor, and offers ergonomic wrappers around the common
//! commands. Everything here is a thin shell — semantics live in the
//! commands and operations.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::command::{
    DeployDefinitionCmd, ExecuteJobCmd, GetExecutionCmd, GetProcessInstanceStateCmd,
    MigrateProcessInstanceCmd, ProcessInstanceState, SetVariablesCmd, StartProcessInstanceCmd,
    TriggerExecutionCmd,
};
use crate::error::EngineError;
use crate::events::{EventDispatcher, FlowEvent};
use crate::executor::{CommandExecutor, OperationExecutionListener, TracingOperationListener};
use crate::model::ProcessDefinition;
use crate::store::RuntimeStore;
use crate::store_memory::MemoryStore;
use crate::types::{
    ExecutionEntity, ExecutionId, InstanceId, MigrationContext, VariableValue,
};

const JOB_ACQUIRE_BATCH: usize = 32;

pub struct ProcessEngineBuilder {
    store: Arc<dyn RuntimeStore>,
    dispatchers: Vec<Box<dyn EventDispatcher>>,
    operation_listeners: Vec<Box<dyn OperationExecutionListener>>,
    async_history: bool,
}

impl ProcessEngineBuilder {
    pub fn new(store: Arc<dyn RuntimeStore>) -> Self {
        Self {
            store,
            dispatchers: Vec::new(),
            operation_listeners: vec![Box::new(TracingOperationListener)],
            async_history: false,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn event_dispatcher(mut self, dispatcher: Box<dyn EventDispatcher>) -> Self {
        self.dispatchers.push(dispatcher);
        self
    }

    pub fn operation_listener(mut self, listener: Box<dyn OperationExecutionListener>) -> Self {
        self.operation_listeners.push(listener);
        self
    }

    /// Capture each command's committed events as persisted history jobs for
    /// asynchronous downstream processing.
    pub fn async_history(mut self, enabled: bool) -> Self {
        self.async_history = enabled;
        self
    }

    pub fn build(self) -> ProcessEngine {
        let executor = CommandExecutor::new(
            self.store.clone(),
            Arc::new(self.dispatchers),
            Arc::new(self.operation_listeners),
            self.async_history,
        );
        info!(async_history = self.async_history, "process engine built");
        ProcessEngine {
            executor,
            store: self.store,
        }
    }
}

pub struct ProcessEngine {
    executor: CommandExecutor,
    store: Arc<dyn RuntimeStore>,
}

impl ProcessEngine {
    pub fn builder(store: Arc<dyn RuntimeStore>) -> ProcessEngineBuilder {
        ProcessEngineBuilder::new(store)
    }

    pub fn in_memory() -> Self {
        ProcessEngineBuilder::in_memory().build()
    }

    /// The underlying executor, for custom commands and shared use across
    /// tasks (it is `Clone`).
    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub async fn deploy(&self, definition: ProcessDefinition) -> Result<String, EngineError> {
        self.executor.execute(&DeployDefinitionCmd { definition }).await
    }

    pub async fn start_process_instance(
        &self,
        definition_id: &str,
        variables: BTreeMap<String, VariableValue>,
    ) -> Result<InstanceId, EngineError> {
        self.executor
            .execute(&StartProcessInstanceCmd {
                definition_id: definition_id.to_string(),
                business_key: None,
                variables,
            })
            .await
    }

    pub async fn trigger(&self, execution_id: ExecutionId) -> Result<(), EngineError> {
        self.executor
            .execute(&TriggerExecutionCmd::new(execution_id))
            .await
    }

    pub async fn trigger_with_variables(
        &self,
        execution_id: ExecutionId,
        variables: BTreeMap<String, VariableValue>,
    ) -> Result<(), EngineError> {
        self.executor
            .execute(&TriggerExecutionCmd {
                execution_id,
                variables,
                trigger_async: false,
            })
            .await
    }

    pub async fn set_variables(
        &self,
        execution_id: ExecutionId,
        variables: BTreeMap<String, VariableValue>,
    ) -> Result<(), EngineError> {
        self.executor
            .execute(&SetVariablesCmd {
                execution_id,
                variables,
            })
            .await
    }

    pub async fn migrate(
        &self,
        process_instance_id: InstanceId,
        migration: MigrationContext,
    ) -> Result<(), EngineError> {
        self.executor
            .execute(&MigrateProcessInstanceCmd {
                process_instance_id,
                migration,
            })
            .await
    }

    /// Acquire and run jobs due at `now`, one transaction per job. Returns
    /// the number of jobs run; callers poll until it reaches zero.
    pub async fn execute_due_jobs(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let due = self.store.due_jobs(now, JOB_ACQUIRE_BATCH).await?;
        let mut executed = 0;
        for job in due {
            self.executor.execute(&ExecuteJobCmd { job_id: job.id }).await?;
            executed += 1;
        }
        Ok(executed)
    }

    pub async fn execution(&self, execution_id: ExecutionId) -> Result<ExecutionEntity, EngineError> {
        self.executor.execute(&GetExecutionCmd { execution_id }).await
    }

    /// The committed event log of an instance, in sequence order.
    pub async fn event_history(
        &self,
        process_instance_id: InstanceId,
    ) -> Result<Vec<(u64, FlowEvent)>, EngineError> {
        Ok(self.store.read_events(process_instance_id, 1).await?)
    }

    pub async fn process_state(
        &self,
        process_instance_id: InstanceId,
    ) -> Result<ProcessInstanceState, EngineError> {
        self.executor
            .execute(&GetProcessInstanceStateCmd {
                process_instance_id,
            })
            .await
    }
}
