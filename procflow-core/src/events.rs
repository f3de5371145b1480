use serde::{Deserialize, Serialize};

use crate::types::{ExecutionId, InstanceId, JobId, VariableValue};

/// Domain events queued during a command and flushed at context close —
/// dispatched in enqueue order, and only after the unit of work committed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FlowEvent {
    ProcessInstanceStarted {
        instance_id: InstanceId,
        definition_id: String,
    },
    ActivityStarted {
        instance_id: InstanceId,
        execution_id: ExecutionId,
        element_id: String,
    },
    ActivityCompleted {
        instance_id: InstanceId,
        execution_id: ExecutionId,
        element_id: String,
    },
    SequenceFlowTaken {
        instance_id: InstanceId,
        execution_id: ExecutionId,
        flow_id: String,
        source: String,
        target: String,
    },
    VariableUpdated {
        instance_id: InstanceId,
        execution_id: ExecutionId,
        name: String,
        value: VariableValue,
    },
    ExecutionMigrated {
        instance_id: InstanceId,
        execution_id: ExecutionId,
        from_element: Option<String>,
        to_element: Option<String>,
        target_definition_id: String,
    },
    JobScheduled {
        instance_id: InstanceId,
        job_id: JobId,
        execution_id: Option<ExecutionId>,
        kind: String,
    },
    MultiInstanceCompleted {
        instance_id: InstanceId,
        execution_id: ExecutionId,
        element_id: String,
        instances: u32,
    },
    ProcessInstanceCompleted {
        instance_id: InstanceId,
    },
}

impl FlowEvent {
    /// The process instance this event belongs to (event-log partition key).
    pub fn instance_id(&self) -> InstanceId {
        match self {
            FlowEvent::ProcessInstanceStarted { instance_id, .. }
            | FlowEvent::ActivityStarted { instance_id, .. }
            | FlowEvent::ActivityCompleted { instance_id, .. }
            | FlowEvent::SequenceFlowTaken { instance_id, .. }
            | FlowEvent::VariableUpdated { instance_id, .. }
            | FlowEvent::ExecutionMigrated { instance_id, .. }
            | FlowEvent::JobScheduled { instance_id, .. }
            | FlowEvent::MultiInstanceCompleted { instance_id, .. }
            | FlowEvent::ProcessInstanceCompleted { instance_id } => *instance_id,
        }
    }
}

/// In-process observer for committed events. Registered at engine build
/// time; must not assume any particular thread.
pub trait EventDispatcher: Send + Sync {
    fn on_event(&self, event: &FlowEvent);
}

impl<T: EventDispatcher + ?Sized> EventDispatcher for std::sync::Arc<T> {
    fn on_event(&self, event: &FlowEvent) {
        (**self).on_event(event)
    }
}

/// Dispatcher that collects events into a shared vec. Useful in tests and as
/// the simplest possible sink.
#[derive(Default)]
pub struct CollectingDispatcher {
    events: std::sync::Mutex<Vec<FlowEvent>>,
}

impl CollectingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<FlowEvent> {
        std::mem::take(&mut self.events.lock().expect("dispatcher lock poisoned"))
    }

    pub fn snapshot(&self) -> Vec<FlowEvent> {
        self.events.lock().expect("dispatcher lock poisoned").clone()
    }
}

impl EventDispatcher for CollectingDispatcher {
    fn on_event(&self, event: &FlowEvent) {
        self.events
            .lock()
            .expect("dispatcher lock poisoned")
            .push(event.clone());
    }
}
