//! Agenda operation behaviors.
//!
//! [`run`] executes exactly one operation against the command context.
//! Operations never block on external input: anything that has to happen
//! later is parked as a wait state or scheduled as a job, and anything that
//! has to happen next is planned back onto the agenda.

use tracing::debug;

use crate::agenda::Operation;
use crate::context::CommandContext;
use crate::error::EngineError;
use crate::events::FlowEvent;
use crate::model::{ElementKind, FlowElement, SequenceFlow};
use crate::types::{
    ExecutionEntity, ExecutionId, InstanceId, JobEntity, JobKind, MigrationContext, VariableValue,
    WaitKind,
};

// Multi-instance bookkeeping variables, kept on the multi-instance root.
const NR_OF_INSTANCES: &str = "nrOfInstances";
const NR_OF_ACTIVE_INSTANCES: &str = "nrOfActiveInstances";
const NR_OF_COMPLETED_INSTANCES: &str = "nrOfCompletedInstances";
const LOOP_COUNTER: &str = "loopCounter";

/// Execute one operation. Called by the executor drain loop and, for the
/// narrow synchronous-bypass paths, by the context itself.
pub(crate) async fn run(ctx: &mut CommandContext, operation: Operation) -> Result<(), EngineError> {
    match operation {
        Operation::ContinueProcess {
            execution_id,
            forced_synchronous,
            migration_context,
        } => continue_process(ctx, execution_id, forced_synchronous, migration_context).await,
        Operation::ContinueMultiInstance {
            execution_id,
            loop_counter,
        } => continue_multi_instance(ctx, execution_id, loop_counter).await,
        Operation::TakeOutgoingSequenceFlows {
            execution_id,
            evaluate_conditions,
        } => take_outgoing_sequence_flows(ctx, execution_id, evaluate_conditions).await,
        Operation::TriggerExecution {
            execution_id,
            trigger_async,
        } => trigger_execution(ctx, execution_id, trigger_async).await,
        Operation::EndExecution { execution_id } => end_execution(ctx, execution_id).await,
        Operation::DestroyScope { execution_id } => destroy_scope(ctx, execution_id).await,
        Operation::ExecuteInactiveBehaviors { process_instance_id } => {
            execute_inactive_behaviors(ctx, process_instance_id).await
        }
        Operation::EvaluateConditionalEvents { process_instance_id } => {
            evaluate_conditional_events(ctx, process_instance_id).await
        }
        Operation::EvaluateVariableListenerEvents { process_instance_id } => {
            evaluate_variable_listener_events(ctx, process_instance_id).await
        }
    }
}

// ─── Continue process ─────────────────────────────────────────

async fn continue_process(
    ctx: &mut CommandContext,
    execution_id: ExecutionId,
    forced_synchronous: bool,
    migration_context: Option<MigrationContext>,
) -> Result<(), EngineError> {
    let mut execution = ctx.execution(execution_id).await?;

    if let Some(migration) = migration_context {
        return migrate_execution(ctx, execution, migration);
    }

    let element_id = execution
        .element_id
        .clone()
        .ok_or(EngineError::NoCurrentElement(execution_id))?;
    let definition = ctx.definition(&execution.definition_id).await?;
    let element = definition
        .element(&element_id)
        .ok_or_else(|| EngineError::ElementNotFound(element_id.clone()))?
        .clone();

    if element.async_before && !forced_synchronous {
        debug!(execution = %execution_id, element = %element_id, "breaking for async continuation");
        execution.waiting = Some(WaitKind::AsyncContinuation);
        ctx.update_execution(execution.clone());
        ctx.schedule_job(JobEntity::new(
            JobKind::AsyncContinue,
            Some(execution_id),
            Some(execution.process_instance_id),
            Some(element_id),
        ));
        return Ok(());
    }

    if let Some(spec) = element.multi_instance.clone() {
        let is_child = execution.variables.contains_key(LOOP_COUNTER);
        if !execution.is_multi_instance_root && !is_child {
            return start_multi_instance(ctx, execution, &element, spec.cardinality, spec.sequential);
        }
    }

    execute_element(ctx, execution, &element).await
}

fn migrate_execution(
    ctx: &mut CommandContext,
    mut execution: ExecutionEntity,
    migration: MigrationContext,
) -> Result<(), EngineError> {
    let from_element = execution.element_id.clone();
    let to_element = from_element
        .as_deref()
        .map(|id| migration.mapped_element(id).to_string());

    execution.definition_id = migration.target_definition_id.clone();
    execution.element_id = to_element.clone();
    // Wait states survive migration untouched; the execution resumes at its
    // mapped element through the usual trigger paths.
    ctx.add_event(FlowEvent::ExecutionMigrated {
        instance_id: execution.process_instance_id,
        execution_id: execution.id,
        from_element,
        to_element,
        target_definition_id: migration.target_definition_id,
    });
    ctx.update_execution(execution);
    Ok(())
}

async fn execute_element(
    ctx: &mut CommandContext,
    mut execution: ExecutionEntity,
    element: &FlowElement,
) -> Result<(), EngineError> {
    ctx.add_event(FlowEvent::ActivityStarted {
        instance_id: execution.process_instance_id,
        execution_id: execution.id,
        element_id: element.id.clone(),
    });

    match &element.kind {
        ElementKind::StartEvent => {
            ctx.plan_take_outgoing_sequence_flows(execution.id, false);
        }
        ElementKind::Task { wait_for_trigger } => {
            if *wait_for_trigger {
                execution.waiting = Some(WaitKind::Trigger);
                ctx.update_execution(execution);
            } else {
                ctx.plan_take_outgoing_sequence_flows(execution.id, false);
            }
        }
        ElementKind::ParallelGateway => {
            if element.incoming_count <= 1 {
                ctx.plan_take_outgoing_sequence_flows(execution.id, false);
            } else {
                join_parallel_gateway(ctx, execution, element).await?;
            }
        }
        ElementKind::ExclusiveGateway => {
            ctx.plan_take_outgoing_sequence_flows(execution.id, true);
        }
        ElementKind::TimerCatchEvent { duration_ms } => {
            let delay =
                chrono::Duration::milliseconds(i64::try_from(*duration_ms).unwrap_or(i64::MAX));
            let due_at = chrono::Utc::now()
                .checked_add_signed(delay)
                .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);
            execution.waiting = Some(WaitKind::Timer);
            ctx.update_execution(execution.clone());
            ctx.schedule_job(JobEntity::new(
                JobKind::Timer { due_at },
                Some(execution.id),
                Some(execution.process_instance_id),
                Some(element.id.clone()),
            ));
        }
        ElementKind::ConditionalCatchEvent { condition } => {
            let condition = condition.clone();
            let resolved = ctx.resolve_variable(execution.id, &condition.variable).await?;
            if condition.evaluate(resolved.as_ref()) {
                ctx.plan_take_outgoing_sequence_flows(execution.id, false);
            } else {
                execution.waiting = Some(WaitKind::Conditional);
                ctx.update_execution(execution);
            }
        }
        ElementKind::VariableListenerCatchEvent { .. } => {
            execution.waiting = Some(WaitKind::VariableListener);
            ctx.update_execution(execution);
        }
        ElementKind::EndEvent => {
            ctx.plan_end_execution(execution.id);
        }
    }
    Ok(())
}

// ─── Parallel gateway ─────────────────────────────────────────

async fn join_parallel_gateway(
    ctx: &mut CommandContext,
    mut execution: ExecutionEntity,
    element: &FlowElement,
) -> Result<(), EngineError> {
    execution.active = false;
    let survivor = execution.id;
    ctx.update_execution(execution.clone());

    let arrived: Vec<ExecutionEntity> = ctx
        .executions_for_instance(execution.process_instance_id)
        .await?
        .into_iter()
        .filter(|e| {
            !e.is_process_instance
                && !e.active
                && e.waiting.is_none()
                && e.element_id.as_deref() == Some(element.id.as_str())
        })
        .collect();

    if arrived.len() as u32 >= element.incoming_count {
        complete_join(ctx, arrived, survivor).await?;
    } else {
        debug!(
            element = %element.id,
            arrived = arrived.len(),
            needed = element.incoming_count,
            "parallel join waiting for siblings"
        );
    }
    Ok(())
}

/// Reactivate the surviving execution, drop the other joined branches, and
/// leave the gateway over all outgoing flows.
async fn complete_join(
    ctx: &mut CommandContext,
    arrived: Vec<ExecutionEntity>,
    survivor: ExecutionId,
) -> Result<(), EngineError> {
    for entity in arrived {
        if entity.id == survivor {
            let mut reactivated = entity;
            reactivated.active = true;
            ctx.update_execution(reactivated);
        } else {
            ctx.remove_execution(entity.id);
        }
    }
    ctx.plan_take_outgoing_sequence_flows(survivor, false);
    Ok(())
}

// ─── Take outgoing sequence flows ─────────────────────────────

async fn take_outgoing_sequence_flows(
    ctx: &mut CommandContext,
    execution_id: ExecutionId,
    evaluate_conditions: bool,
) -> Result<(), EngineError> {
    let mut execution = ctx.execution(execution_id).await?;
    let element_id = execution
        .element_id
        .clone()
        .ok_or(EngineError::NoCurrentElement(execution_id))?;

    // A multi-instance child leaving its element completes one loop instance
    // instead of taking flows.
    if let Some(parent_id) = execution.parent_id {
        let parent = ctx.execution(parent_id).await?;
        if parent.is_multi_instance_root
            && parent.element_id.as_deref() == Some(element_id.as_str())
        {
            return multi_instance_child_completed(ctx, execution, parent).await;
        }
    }

    let definition = ctx.definition(&execution.definition_id).await?;
    let element = definition
        .element(&element_id)
        .ok_or_else(|| EngineError::ElementNotFound(element_id.clone()))?
        .clone();

    ctx.add_event(FlowEvent::ActivityCompleted {
        instance_id: execution.process_instance_id,
        execution_id,
        element_id: element_id.clone(),
    });

    if element.outgoing.is_empty() {
        return Err(EngineError::NoOutgoingFlow(element_id));
    }

    let chosen = if evaluate_conditions {
        vec![select_exclusive_flow(ctx, execution_id, &element).await?]
    } else {
        element.outgoing.clone()
    };

    // The current execution takes the first flow; additional flows fork
    // sibling executions. All continuations are planned before any runs, so
    // branches unfold in waves.
    let mut flows = chosen.into_iter();
    if let Some(first) = flows.next() {
        ctx.add_event(FlowEvent::SequenceFlowTaken {
            instance_id: execution.process_instance_id,
            execution_id,
            flow_id: first.id.clone(),
            source: element_id.clone(),
            target: first.target.clone(),
        });
        execution.element_id = Some(first.target);
        execution.active = true;
        execution.waiting = None;
        ctx.update_execution(execution.clone());
        ctx.plan_continue_process(execution_id);
    }

    for flow in flows {
        let sibling = match execution.parent_id {
            Some(parent_id) => ctx.execution(parent_id).await?.new_child(&flow.target),
            None => execution.new_child(&flow.target),
        };
        ctx.add_event(FlowEvent::SequenceFlowTaken {
            instance_id: sibling.process_instance_id,
            execution_id: sibling.id,
            flow_id: flow.id,
            source: element_id.clone(),
            target: flow.target,
        });
        let sibling_id = sibling.id;
        ctx.insert_execution(sibling);
        ctx.plan_continue_process(sibling_id);
    }

    Ok(())
}

/// Exclusive gateway selection: first matching conditional flow wins; an
/// unconditional flow is the default when nothing matches.
async fn select_exclusive_flow(
    ctx: &mut CommandContext,
    execution_id: ExecutionId,
    element: &FlowElement,
) -> Result<SequenceFlow, EngineError> {
    for flow in &element.outgoing {
        if let Some(condition) = &flow.condition {
            let resolved = ctx.resolve_variable(execution_id, &condition.variable).await?;
            if condition.evaluate(resolved.as_ref()) {
                return Ok(flow.clone());
            }
        }
    }
    element
        .outgoing
        .iter()
        .find(|f| f.condition.is_none())
        .cloned()
        .ok_or_else(|| EngineError::NoFlowTaken(element.id.clone()))
}

// ─── Multi-instance ───────────────────────────────────────────

fn start_multi_instance(
    ctx: &mut CommandContext,
    mut root: ExecutionEntity,
    element: &FlowElement,
    cardinality: u32,
    sequential: bool,
) -> Result<(), EngineError> {
    ctx.add_event(FlowEvent::ActivityStarted {
        instance_id: root.process_instance_id,
        execution_id: root.id,
        element_id: element.id.clone(),
    });

    if cardinality == 0 {
        ctx.add_event(FlowEvent::MultiInstanceCompleted {
            instance_id: root.process_instance_id,
            execution_id: root.id,
            element_id: element.id.clone(),
            instances: 0,
        });
        ctx.plan_take_outgoing_sequence_flows(root.id, false);
        return Ok(());
    }

    let spawn_now = if sequential { 1 } else { cardinality };
    root.active = false;
    root.is_multi_instance_root = true;
    root.variables.insert(
        NR_OF_INSTANCES.to_string(),
        VariableValue::I64(cardinality as i64),
    );
    root.variables.insert(
        NR_OF_ACTIVE_INSTANCES.to_string(),
        VariableValue::I64(spawn_now as i64),
    );
    root.variables
        .insert(NR_OF_COMPLETED_INSTANCES.to_string(), VariableValue::I64(0));

    for loop_counter in 0..spawn_now {
        let mut child = root.new_child(&element.id);
        child
            .variables
            .insert(LOOP_COUNTER.to_string(), VariableValue::I64(loop_counter as i64));
        let child_id = child.id;
        ctx.insert_execution(child);
        ctx.plan_continue_multi_instance(child_id, loop_counter);
    }
    ctx.update_execution(root);
    Ok(())
}

async fn continue_multi_instance(
    ctx: &mut CommandContext,
    execution_id: ExecutionId,
    loop_counter: u32,
) -> Result<(), EngineError> {
    let mut child = ctx.execution(execution_id).await?;
    child.variables.insert(
        LOOP_COUNTER.to_string(),
        VariableValue::I64(loop_counter as i64),
    );
    ctx.update_execution(child);
    ctx.continue_process_synchronously(execution_id).await
}

async fn multi_instance_child_completed(
    ctx: &mut CommandContext,
    child: ExecutionEntity,
    mut root: ExecutionEntity,
) -> Result<(), EngineError> {
    let element_id = match root.element_id.clone() {
        Some(id) => id,
        None => return Err(EngineError::NoCurrentElement(root.id)),
    };

    ctx.add_event(FlowEvent::ActivityCompleted {
        instance_id: child.process_instance_id,
        execution_id: child.id,
        element_id: element_id.clone(),
    });
    ctx.remove_execution(child.id);

    let total = mi_counter(&root, NR_OF_INSTANCES);
    let completed = mi_counter(&root, NR_OF_COMPLETED_INSTANCES) + 1;
    let active = mi_counter(&root, NR_OF_ACTIVE_INSTANCES).saturating_sub(1);
    root.variables.insert(
        NR_OF_COMPLETED_INSTANCES.to_string(),
        VariableValue::I64(completed),
    );
    root.variables.insert(
        NR_OF_ACTIVE_INSTANCES.to_string(),
        VariableValue::I64(active),
    );

    if completed >= total {
        root.is_multi_instance_root = false;
        root.active = true;
        root.variables.remove(NR_OF_INSTANCES);
        root.variables.remove(NR_OF_ACTIVE_INSTANCES);
        root.variables.remove(NR_OF_COMPLETED_INSTANCES);
        ctx.add_event(FlowEvent::MultiInstanceCompleted {
            instance_id: root.process_instance_id,
            execution_id: root.id,
            element_id,
            instances: total as u32,
        });
        let root_id = root.id;
        ctx.update_execution(root);
        ctx.plan_take_outgoing_sequence_flows(root_id, false);
        return Ok(());
    }

    let definition = ctx.definition(&root.definition_id).await?;
    let sequential = definition
        .element(&element_id)
        .and_then(|e| e.multi_instance.as_ref())
        .map(|spec| spec.sequential)
        .unwrap_or(false);

    if sequential {
        let loop_counter = completed as u32;
        let mut next = root.new_child(&element_id);
        next.variables.insert(
            LOOP_COUNTER.to_string(),
            VariableValue::I64(loop_counter as i64),
        );
        root.variables.insert(
            NR_OF_ACTIVE_INSTANCES.to_string(),
            VariableValue::I64(active + 1),
        );
        let next_id = next.id;
        ctx.insert_execution(next);
        ctx.plan_continue_multi_instance(next_id, loop_counter);
    }
    ctx.update_execution(root);
    Ok(())
}

fn mi_counter(root: &ExecutionEntity, name: &str) -> i64 {
    root.variables
        .get(name)
        .and_then(VariableValue::as_i64)
        .unwrap_or(0)
}

// ─── Trigger ──────────────────────────────────────────────────

async fn trigger_execution(
    ctx: &mut CommandContext,
    execution_id: ExecutionId,
    trigger_async: bool,
) -> Result<(), EngineError> {
    let mut execution = ctx.execution(execution_id).await?;
    let waiting = execution.waiting.ok_or(EngineError::NotWaiting(execution_id))?;

    if trigger_async {
        ctx.schedule_job(JobEntity::new(
            JobKind::AsyncTrigger,
            Some(execution_id),
            Some(execution.process_instance_id),
            execution.element_id.clone(),
        ));
        return Ok(());
    }

    execution.waiting = None;
    ctx.update_execution(execution);
    match waiting {
        // The element itself was deferred; run it now, past the async break.
        WaitKind::AsyncContinuation => ctx.plan_continue_process_forced_synchronous(execution_id),
        WaitKind::Trigger
        | WaitKind::Timer
        | WaitKind::Conditional
        | WaitKind::VariableListener => {
            ctx.plan_take_outgoing_sequence_flows(execution_id, false)
        }
    }
    Ok(())
}

// ─── End / destroy ────────────────────────────────────────────

async fn end_execution(ctx: &mut CommandContext, execution_id: ExecutionId) -> Result<(), EngineError> {
    let execution = ctx.execution(execution_id).await?;
    let instance_id = execution.process_instance_id;
    if let Some(element_id) = execution.element_id.clone() {
        ctx.add_event(FlowEvent::ActivityCompleted {
            instance_id,
            execution_id,
            element_id,
        });
    }
    ctx.remove_execution(execution_id);

    let remaining: Vec<ExecutionEntity> = ctx
        .executions_for_instance(instance_id)
        .await?
        .into_iter()
        .filter(|e| !e.is_process_instance)
        .collect();

    if remaining.is_empty() {
        ctx.plan_destroy_scope(instance_id);
    } else if remaining.iter().all(|e| !e.active) && remaining.iter().any(|e| e.waiting.is_none()) {
        // Only parked gateway executions are left; a join may have become
        // completable now that this branch ended.
        ctx.plan_execute_inactive_behaviors(instance_id);
    }
    Ok(())
}

async fn destroy_scope(ctx: &mut CommandContext, execution_id: ExecutionId) -> Result<(), EngineError> {
    let root = ctx.execution(execution_id).await?;
    let instance_id = root.process_instance_id;
    for entity in ctx.executions_for_instance(instance_id).await? {
        ctx.remove_execution(entity.id);
    }
    ctx.add_event(FlowEvent::ProcessInstanceCompleted { instance_id });
    Ok(())
}

// ─── Instance-wide re-evaluations ─────────────────────────────

async fn execute_inactive_behaviors(
    ctx: &mut CommandContext,
    process_instance_id: InstanceId,
) -> Result<(), EngineError> {
    let parked: Vec<ExecutionEntity> = ctx
        .executions_for_instance(process_instance_id)
        .await?
        .into_iter()
        .filter(|e| {
            !e.is_process_instance && !e.active && e.waiting.is_none() && e.element_id.is_some()
        })
        .collect();

    let mut by_element: std::collections::BTreeMap<String, Vec<ExecutionEntity>> =
        std::collections::BTreeMap::new();
    for entity in parked {
        if let Some(element_id) = entity.element_id.clone() {
            by_element.entry(element_id).or_default().push(entity);
        }
    }

    for (element_id, group) in by_element {
        let definition = ctx.definition(&group[0].definition_id).await?;
        let Some(element) = definition.element(&element_id) else {
            continue;
        };
        if matches!(element.kind, ElementKind::ParallelGateway)
            && group.len() as u32 >= element.incoming_count
        {
            let survivor = group[0].id;
            complete_join(ctx, group, survivor).await?;
        }
    }
    Ok(())
}

async fn evaluate_conditional_events(
    ctx: &mut CommandContext,
    process_instance_id: InstanceId,
) -> Result<(), EngineError> {
    let waiting: Vec<ExecutionEntity> = ctx
        .executions_for_instance(process_instance_id)
        .await?
        .into_iter()
        .filter(|e| e.waiting == Some(WaitKind::Conditional))
        .collect();

    for entity in waiting {
        let definition = ctx.definition(&entity.definition_id).await?;
        let Some(element) = entity
            .element_id
            .as_deref()
            .and_then(|id| definition.element(id))
        else {
            continue;
        };
        let ElementKind::ConditionalCatchEvent { condition } = &element.kind else {
            continue;
        };
        let condition = condition.clone();
        let resolved = ctx.resolve_variable(entity.id, &condition.variable).await?;
        if condition.evaluate(resolved.as_ref()) {
            let mut resumed = ctx.execution(entity.id).await?;
            resumed.waiting = None;
            ctx.update_execution(resumed);
            ctx.plan_take_outgoing_sequence_flows(entity.id, false);
        }
    }
    Ok(())
}

async fn evaluate_variable_listener_events(
    ctx: &mut CommandContext,
    process_instance_id: InstanceId,
) -> Result<(), EngineError> {
    let touched = ctx.variables_touched(process_instance_id);
    if touched.is_empty() {
        return Ok(());
    }

    let waiting: Vec<ExecutionEntity> = ctx
        .executions_for_instance(process_instance_id)
        .await?
        .into_iter()
        .filter(|e| e.waiting == Some(WaitKind::VariableListener))
        .collect();

    for entity in waiting {
        let definition = ctx.definition(&entity.definition_id).await?;
        let Some(element) = entity
            .element_id
            .as_deref()
            .and_then(|id| definition.element(id))
        else {
            continue;
        };
        let ElementKind::VariableListenerCatchEvent { variable_name } = &element.kind else {
            continue;
        };
        if touched.contains(variable_name) {
            let mut resumed = ctx.execution(entity.id).await?;
            resumed.waiting = None;
            ctx.update_execution(resumed);
            ctx.plan_take_outgoing_sequence_flows(entity.id, false);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FlowCondition, ProcessDefinitionBuilder};
    use crate::store_memory::MemoryStore;
    use std::sync::Arc;

    async fn context_with(definition: crate::model::ProcessDefinition) -> CommandContext {
        let store = Arc::new(MemoryStore::new());
        let mut ctx = CommandContext::new(store, Arc::new(Vec::new()), false);
        ctx.deploy_definition(definition);
        ctx
    }

    async fn drain(ctx: &mut CommandContext) -> Result<(), EngineError> {
        while let Some(op) = ctx.take_next_operation() {
            run(ctx, op).await?;
        }
        Ok(())
    }

    fn start_instance(ctx: &mut CommandContext, definition_id: &str) -> ExecutionId {
        let root = ExecutionEntity::new_process_instance(definition_id, None);
        let child = root.new_child("start");
        let child_id = child.id;
        ctx.insert_execution(root);
        ctx.insert_execution(child);
        ctx.plan_continue_process(child_id);
        child_id
    }

    #[tokio::test]
    async fn straight_line_process_runs_to_completion() {
        let definition = ProcessDefinitionBuilder::new("p")
            .start_event("start")
            .task("work")
            .end_event("end")
            .flow("start", "work")
            .flow("work", "end")
            .build()
            .unwrap();
        let mut ctx = context_with(definition).await;
        let child_id = start_instance(&mut ctx, "p:1");
        let instance_id = ctx.execution(child_id).await.unwrap().process_instance_id;

        drain(&mut ctx).await.unwrap();
        assert!(ctx.executions_for_instance(instance_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exclusive_gateway_takes_matching_branch() {
        let definition = ProcessDefinitionBuilder::new("p")
            .start_event("start")
            .exclusive_gateway("decide")
            .task("approve")
            .task("reject")
            .end_event("end")
            .flow("start", "decide")
            .conditional_flow("decide", "approve", FlowCondition::truthy("ok"))
            .flow("decide", "reject")
            .flow("approve", "end")
            .flow("reject", "end")
            .build()
            .unwrap();
        let mut ctx = context_with(definition).await;
        let child_id = start_instance(&mut ctx, "p:1");
        ctx.set_variable(child_id, "ok", VariableValue::Bool(true))
            .await
            .unwrap();

        drain(&mut ctx).await.unwrap();
        // Approve branch was the one that ran.
        let mut saw_approve = false;
        for event in fetch_events(&ctx) {
            if let FlowEvent::ActivityStarted { element_id, .. } = event {
                assert_ne!(element_id, "reject");
                saw_approve |= element_id == "approve";
            }
        }
        assert!(saw_approve);
    }

    #[tokio::test]
    async fn parallel_join_waits_for_all_branches() {
        let definition = ProcessDefinitionBuilder::new("p")
            .start_event("start")
            .parallel_gateway("fork")
            .task("a")
            .user_task("b")
            .parallel_gateway("join")
            .end_event("end")
            .flow("start", "fork")
            .flow("fork", "a")
            .flow("fork", "b")
            .flow("a", "join")
            .flow("b", "join")
            .flow("join", "end")
            .build()
            .unwrap();
        let mut ctx = context_with(definition).await;
        let child_id = start_instance(&mut ctx, "p:1");
        let instance_id = ctx.execution(child_id).await.unwrap().process_instance_id;

        drain(&mut ctx).await.unwrap();
        // Branch `a` is parked at the join; `b` waits for its trigger.
        let executions = ctx.executions_for_instance(instance_id).await.unwrap();
        let waiting: Vec<_> = executions.iter().filter(|e| e.is_waiting()).collect();
        assert_eq!(waiting.len(), 1);
        let trigger_id = waiting[0].id;

        ctx.plan_trigger_execution(trigger_id, false);
        drain(&mut ctx).await.unwrap();
        assert!(ctx.executions_for_instance(instance_id).await.unwrap().is_empty());
    }

    fn fetch_events(ctx: &CommandContext) -> Vec<FlowEvent> {
        ctx.pending_events().to_vec()
    }
}
