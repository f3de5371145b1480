//! The agenda: an ordered queue of pending operations for one command
//! context.
//!
//! Operations planned while another operation runs are appended after
//! everything already queued, so the execution graph unfolds breadth-first —
//! a forking gateway plans continuations for all branches before any branch
//! runs. The queue is drained by exactly one thread, the one that owns the
//! enclosing command context.

use std::collections::VecDeque;

use crate::types::{ExecutionId, InstanceId, MigrationContext};

/// One discrete step of engine work. A closed set of kinds, each carrying
/// only the data it needs; executing an operation may plan further
/// operations.
#[derive(Clone, Debug)]
pub enum Operation {
    /// Execute the behavior of the execution's current element.
    /// `forced_synchronous` suppresses async_before job scheduling (set when
    /// re-entering from the job executor). A migration context re-points the
    /// execution before continuing.
    ContinueProcess {
        execution_id: ExecutionId,
        forced_synchronous: bool,
        migration_context: Option<MigrationContext>,
    },
    /// Continue one multi-instance child with its loop counter.
    ContinueMultiInstance {
        execution_id: ExecutionId,
        loop_counter: u32,
    },
    /// Leave the current element over its outgoing sequence flows.
    TakeOutgoingSequenceFlows {
        execution_id: ExecutionId,
        evaluate_conditions: bool,
    },
    /// Resume a waiting execution. `trigger_async` schedules a job instead
    /// of resuming inline.
    TriggerExecution {
        execution_id: ExecutionId,
        trigger_async: bool,
    },
    /// End one execution; completes the instance when it was the last.
    EndExecution { execution_id: ExecutionId },
    /// Tear down an execution scope and everything beneath it.
    DestroyScope { execution_id: ExecutionId },
    /// Re-examine inactive gateway executions (joins completable after a
    /// sibling branch ended).
    ExecuteInactiveBehaviors { process_instance_id: InstanceId },
    /// Re-evaluate conditional catch events against current variables.
    EvaluateConditionalEvents { process_instance_id: InstanceId },
    /// Fire variable-listener catch events for variables written in this
    /// command.
    EvaluateVariableListenerEvents { process_instance_id: InstanceId },
}

impl Operation {
    /// Target execution, if the operation is scoped to one. Global
    /// operations return None; listeners must treat that as a no-op.
    pub fn execution_id(&self) -> Option<ExecutionId> {
        match self {
            Operation::ContinueProcess { execution_id, .. }
            | Operation::ContinueMultiInstance { execution_id, .. }
            | Operation::TakeOutgoingSequenceFlows { execution_id, .. }
            | Operation::TriggerExecution { execution_id, .. }
            | Operation::EndExecution { execution_id }
            | Operation::DestroyScope { execution_id } => Some(*execution_id),
            Operation::ExecuteInactiveBehaviors { .. }
            | Operation::EvaluateConditionalEvents { .. }
            | Operation::EvaluateVariableListenerEvents { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Operation::ContinueProcess { .. } => "continue-process",
            Operation::ContinueMultiInstance { .. } => "continue-multi-instance",
            Operation::TakeOutgoingSequenceFlows { .. } => "take-outgoing-sequence-flows",
            Operation::TriggerExecution { .. } => "trigger-execution",
            Operation::EndExecution { .. } => "end-execution",
            Operation::DestroyScope { .. } => "destroy-scope",
            Operation::ExecuteInactiveBehaviors { .. } => "execute-inactive-behaviors",
            Operation::EvaluateConditionalEvents { .. } => "evaluate-conditional-events",
            Operation::EvaluateVariableListenerEvents { .. } => {
                "evaluate-variable-listener-events"
            }
        }
    }
}

/// FIFO operation queue, one per command context.
#[derive(Default)]
pub struct Agenda {
    queue: VecDeque<Operation>,
}

impl Agenda {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail — the normal path.
    pub fn plan(&mut self, operation: Operation) {
        self.queue.push_back(operation);
    }

    /// Insert at the head, ahead of already-queued work. The narrow
    /// priority path; normal planning must go through [`Agenda::plan`].
    pub fn plan_next(&mut self, operation: Operation) {
        self.queue.push_front(operation);
    }

    pub fn next_operation(&mut self) -> Option<Operation> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Peek the queued operations in drain order — diagnostics only.
    pub fn pending(&self) -> impl Iterator<Item = &Operation> {
        self.queue.iter()
    }
}
