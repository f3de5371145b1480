//! Agenda-driven process execution core
//!
//! The engine runs process instances through small, composable pieces:
//! - `Command` - one intent-shaped unit of work with a typed result
//! - `CommandContext` - the transactional unit of work a command runs in
//! - `Agenda` / `Operation` - the FIFO queue of engine steps a command plans
//! - `CommandExecutor` - opens a context, drains the agenda, commits or
//!   rolls back
//! - `RuntimeStore` - pluggable persistence; `MemoryStore` ships in-crate
//!
//! A top-level command plans operations; executing an operation may plan
//! further operations, unfolding the process graph breadth-first. All state
//! changes, scheduled jobs and domain events of one command commit
//! atomically when the context closes, and observers only ever see
//! committed work.

pub mod agenda;
mod cache;
pub mod command;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod model;
mod operations;
pub mod store;
pub mod store_memory;
pub mod types;

pub use agenda::{Agenda, Operation};
pub use command::{
    Command, DeployDefinitionCmd, ExecuteJobCmd, GetExecutionCmd, GetProcessInstanceStateCmd,
    MigrateProcessInstanceCmd, ProcessInstanceState, SetVariablesCmd, StartProcessInstanceCmd,
    TriggerExecutionCmd,
};
pub use context::{ClosePhase, CloseListener, CommandContext};
pub use engine::{ProcessEngine, ProcessEngineBuilder};
pub use error::EngineError;
pub use events::{CollectingDispatcher, EventDispatcher, FlowEvent};
pub use executor::{CommandExecutor, OperationExecutionListener, TracingOperationListener};
pub use model::{
    ElementKind, FlowCondition, FlowElement, ModelError, MultiInstanceSpec, ProcessDefinition,
    ProcessDefinitionBuilder, SequenceFlow,
};
pub use store::{ChangeSet, ExecutionDelete, ExecutionWrite, RuntimeStore, StoreError};
pub use store_memory::MemoryStore;
pub use types::{
    ExecutionEntity, ExecutionId, InstanceId, JobEntity, JobId, JobKind, MigrationContext,
    VariableValue, WaitKind,
};
