//! Commands: the intent-shaped API units of the engine.
//!
//! A command encapsulates one piece of engine work and runs inside a
//! [`CommandContext`]. Commands plan operations; the executor drains the
//! agenda after the command body returns and commits everything atomically.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::context::CommandContext;
use crate::error::EngineError;
use crate::events::FlowEvent;
use crate::model::ProcessDefinition;
use crate::types::{
    ExecutionEntity, ExecutionId, InstanceId, JobId, JobKind, MigrationContext, VariableValue,
    WaitKind,
};

/// One unit of engine work with a typed result.
///
/// Commands must not perform I/O outside the context: all reads and writes go
/// through the context so the unit of work stays atomic. A command invoked
/// from inside another command (via [`CommandContext::run_command`]) shares
/// the outer transaction and agenda.
#[async_trait]
pub trait Command: Send + Sync {
    type Output: Send;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Self::Output, EngineError>;

    /// Stable name for logs and operation listeners.
    fn name(&self) -> &'static str;
}

// ─── Deploy ───────────────────────────────────────────────────

pub struct DeployDefinitionCmd {
    pub definition: ProcessDefinition,
}

#[async_trait]
impl Command for DeployDefinitionCmd {
    type Output = String;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<String, EngineError> {
        let id = self.definition.id.clone();
        ctx.deploy_definition(self.definition.clone());
        Ok(id)
    }

    fn name(&self) -> &'static str {
        "deploy-definition"
    }
}

// ─── Start ────────────────────────────────────────────────────

pub struct StartProcessInstanceCmd {
    pub definition_id: String,
    pub business_key: Option<String>,
    pub variables: BTreeMap<String, VariableValue>,
}

impl StartProcessInstanceCmd {
    pub fn new(definition_id: &str) -> Self {
        Self {
            definition_id: definition_id.to_string(),
            business_key: None,
            variables: BTreeMap::new(),
        }
    }
}

#[async_trait]
impl Command for StartProcessInstanceCmd {
    type Output = InstanceId;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<InstanceId, EngineError> {
        let definition = ctx.definition(&self.definition_id).await?;
        let initial = definition
            .initial_element()
            .ok_or_else(|| EngineError::ElementNotFound(definition.initial.clone()))?
            .id
            .clone();

        let root =
            ExecutionEntity::new_process_instance(&definition.id, self.business_key.clone());
        let instance_id = root.id;
        let child = root.new_child(&initial);
        let child_id = child.id;
        ctx.insert_execution(root);
        ctx.insert_execution(child);
        ctx.add_event(FlowEvent::ProcessInstanceStarted {
            instance_id,
            definition_id: definition.id.clone(),
        });

        for (name, value) in &self.variables {
            ctx.set_variable(instance_id, name, value.clone()).await?;
        }
        ctx.plan_continue_process(child_id);
        Ok(instance_id)
    }

    fn name(&self) -> &'static str {
        "start-process-instance"
    }
}

// ─── Trigger ──────────────────────────────────────────────────

pub struct TriggerExecutionCmd {
    pub execution_id: ExecutionId,
    pub variables: BTreeMap<String, VariableValue>,
    pub trigger_async: bool,
}

impl TriggerExecutionCmd {
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            variables: BTreeMap::new(),
            trigger_async: false,
        }
    }
}

#[async_trait]
impl Command for TriggerExecutionCmd {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        let instance_id = ctx.execution(self.execution_id).await?.process_instance_id;
        for (name, value) in &self.variables {
            ctx.set_variable(self.execution_id, name, value.clone()).await?;
        }
        ctx.plan_trigger_execution(self.execution_id, self.trigger_async);
        if !self.variables.is_empty() {
            ctx.plan_evaluate_conditional_events(instance_id);
            ctx.plan_evaluate_variable_listener_events(instance_id);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "trigger-execution"
    }
}

// ─── Variables ────────────────────────────────────────────────

pub struct SetVariablesCmd {
    pub execution_id: ExecutionId,
    pub variables: BTreeMap<String, VariableValue>,
}

#[async_trait]
impl Command for SetVariablesCmd {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        let instance_id = ctx.execution(self.execution_id).await?.process_instance_id;
        for (name, value) in &self.variables {
            ctx.set_variable(self.execution_id, name, value.clone()).await?;
        }
        // Variable writes can unblock conditional and variable-listener
        // waits anywhere in the instance.
        ctx.plan_evaluate_conditional_events(instance_id);
        ctx.plan_evaluate_variable_listener_events(instance_id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "set-variables"
    }
}

// ─── Jobs ─────────────────────────────────────────────────────

/// Run one persisted job inside a fresh transaction. The external job
/// executor acquires due jobs and issues one of these per job.
pub struct ExecuteJobCmd {
    pub job_id: JobId,
}

#[async_trait]
impl Command for ExecuteJobCmd {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        let job = ctx.job(self.job_id).await?;
        ctx.remove_job(self.job_id);

        if let JobKind::History { .. } = &job.kind {
            // The history transformer component consumes the payload out of
            // band; this core only removes the job.
            tracing::debug!(job = %job.id, "history job consumed");
            return Ok(());
        }

        let execution_id = job
            .execution_id
            .ok_or_else(|| EngineError::Internal("job has no target execution".into()))?;

        // The wait this job was scheduled for may have been cleared by
        // another path in the meantime. A stale job is consumed without
        // resuming anything.
        let execution = match ctx.execution(execution_id).await {
            Ok(execution) => execution,
            Err(EngineError::ExecutionNotFound(_)) => {
                tracing::debug!(job = %job.id, "job target no longer exists, dropping");
                return Ok(());
            }
            Err(error) => return Err(error),
        };
        let wait_matches = match &job.kind {
            JobKind::AsyncContinue => execution.waiting == Some(WaitKind::AsyncContinuation),
            JobKind::Timer { .. } => execution.waiting == Some(WaitKind::Timer),
            JobKind::AsyncTrigger => execution.is_waiting(),
            JobKind::History { .. } => false,
        };
        if !wait_matches || job.element_id != execution.element_id {
            tracing::debug!(job = %job.id, kind = job.kind.as_str(), "stale job dropped");
            return Ok(());
        }

        ctx.plan_trigger_execution(execution_id, false);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "execute-job"
    }
}

// ─── Migration ────────────────────────────────────────────────

pub struct MigrateProcessInstanceCmd {
    pub process_instance_id: InstanceId,
    pub migration: MigrationContext,
}

#[async_trait]
impl Command for MigrateProcessInstanceCmd {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        ctx.definition(&self.migration.target_definition_id).await?;
        let executions = ctx.executions_for_instance(self.process_instance_id).await?;
        if executions.is_empty() {
            return Err(EngineError::ProcessInstanceNotFound(self.process_instance_id));
        }
        for execution in executions {
            ctx.plan_continue_process_with_migration(execution.id, self.migration.clone());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "migrate-process-instance"
    }
}

// ─── Queries ──────────────────────────────────────────────────

pub struct GetExecutionCmd {
    pub execution_id: ExecutionId,
}

#[async_trait]
impl Command for GetExecutionCmd {
    type Output = ExecutionEntity;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<ExecutionEntity, EngineError> {
        ctx.execution(self.execution_id).await
    }

    fn name(&self) -> &'static str {
        "get-execution"
    }
}

/// Snapshot of an instance's runtime state.
#[derive(Clone, Debug)]
pub struct ProcessInstanceState {
    pub instance_id: InstanceId,
    pub executions: Vec<ExecutionEntity>,
    /// True when no runtime executions remain.
    pub completed: bool,
}

pub struct GetProcessInstanceStateCmd {
    pub process_instance_id: InstanceId,
}

#[async_trait]
impl Command for GetProcessInstanceStateCmd {
    type Output = ProcessInstanceState;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<ProcessInstanceState, EngineError> {
        let executions = ctx.executions_for_instance(self.process_instance_id).await?;
        Ok(ProcessInstanceState {
            instance_id: self.process_instance_id,
            completed: executions.is_empty(),
            executions,
        })
    }

    fn name(&self) -> &'static str {
        "get-process-instance-state"
    }
}
