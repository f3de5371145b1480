//! Command executor: opens a context per top-level command, runs the command
//! body, drains the agenda, and closes the context exactly once.
//!
//! Operation listeners wrap every agenda operation. Before-hooks run in
//! registration order and may veto the operation; after-hooks run in reverse
//! registration order and observe the outcome. Every operation whose
//! before-hooks ran gets its after-hooks, success or failure.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::agenda::Operation;
use crate::command::Command;
use crate::context::CommandContext;
use crate::error::EngineError;
use crate::events::EventDispatcher;
use crate::operations;
use crate::store::RuntimeStore;

/// Observes (and may veto) individual agenda operations.
pub trait OperationExecutionListener: Send + Sync {
    /// Runs before the operation. Returning an error vetoes it and fails
    /// the whole command.
    fn before_execute(&self, ctx: &CommandContext, operation: &Operation) -> Result<(), String>;

    /// Runs after the operation with its outcome. Must not panic; a failed
    /// operation still reaches every after-hook whose before-hook ran.
    fn after_execute(
        &self,
        ctx: &CommandContext,
        operation: &Operation,
        result: &Result<(), EngineError>,
    );
}

impl<T: OperationExecutionListener + ?Sized> OperationExecutionListener for Arc<T> {
    fn before_execute(&self, ctx: &CommandContext, operation: &Operation) -> Result<(), String> {
        (**self).before_execute(ctx, operation)
    }

    fn after_execute(
        &self,
        ctx: &CommandContext,
        operation: &Operation,
        result: &Result<(), EngineError>,
    ) {
        (**self).after_execute(ctx, operation, result)
    }
}

/// Listener that traces operation boundaries. Registered by default when the
/// engine is built with tracing enabled.
pub struct TracingOperationListener;

impl OperationExecutionListener for TracingOperationListener {
    fn before_execute(&self, _ctx: &CommandContext, operation: &Operation) -> Result<(), String> {
        debug!(operation = operation.kind(), "operation starting");
        Ok(())
    }

    fn after_execute(
        &self,
        _ctx: &CommandContext,
        operation: &Operation,
        result: &Result<(), EngineError>,
    ) {
        match result {
            Ok(()) => debug!(operation = operation.kind(), "operation finished"),
            Err(error) => warn!(operation = operation.kind(), %error, "operation failed"),
        }
    }
}

/// Entry point for running commands. Cheap to clone; clones share the store,
/// dispatchers and listeners.
#[derive(Clone)]
pub struct CommandExecutor {
    store: Arc<dyn RuntimeStore>,
    dispatchers: Arc<Vec<Box<dyn EventDispatcher>>>,
    operation_listeners: Arc<Vec<Box<dyn OperationExecutionListener>>>,
    async_history: bool,
}

impl CommandExecutor {
    pub(crate) fn new(
        store: Arc<dyn RuntimeStore>,
        dispatchers: Arc<Vec<Box<dyn EventDispatcher>>>,
        operation_listeners: Arc<Vec<Box<dyn OperationExecutionListener>>>,
        async_history: bool,
    ) -> Self {
        Self {
            store,
            dispatchers,
            operation_listeners,
            async_history,
        }
    }

    /// Run one top-level command in its own unit of work. The command body
    /// runs first, then the agenda is drained to empty; everything commits
    /// atomically at close, or nothing does.
    pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Output, EngineError> {
        let mut ctx = CommandContext::new(
            self.store.clone(),
            self.dispatchers.clone(),
            self.async_history,
        );
        debug!(command = command.name(), "executing command");

        match self.run_to_quiescence(&mut ctx, command).await {
            Ok(output) => {
                ctx.close().await?;
                Ok(output)
            }
            Err(error) => {
                ctx.record_failure(error.to_string());
                if let Err(close_error) = ctx.close().await {
                    warn!(%close_error, "context close failed during rollback");
                }
                Err(error)
            }
        }
    }

    async fn run_to_quiescence<C: Command>(
        &self,
        ctx: &mut CommandContext,
        command: &C,
    ) -> Result<C::Output, EngineError> {
        let output = command.execute(ctx).await?;
        while let Some(operation) = ctx.take_next_operation() {
            self.run_operation(ctx, operation).await?;
        }
        Ok(output)
    }

    async fn run_operation(
        &self,
        ctx: &mut CommandContext,
        operation: Operation,
    ) -> Result<(), EngineError> {
        let listeners = &self.operation_listeners;

        let mut before_ran = 0;
        for listener in listeners.iter() {
            if let Err(reason) = listener.before_execute(ctx, &operation) {
                let result = Err(EngineError::ListenerRejected {
                    operation: operation.kind().to_string(),
                    reason,
                });
                for seen in listeners[..before_ran].iter().rev() {
                    seen.after_execute(ctx, &operation, &result);
                }
                return result;
            }
            before_ran += 1;
        }

        let result = operations::run(ctx, operation.clone()).await;
        for listener in listeners.iter().rev() {
            listener.after_execute(ctx, &operation, &result);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{DeployDefinitionCmd, StartProcessInstanceCmd};
    use crate::model::ProcessDefinitionBuilder;
    use crate::store_memory::MemoryStore;
    use std::sync::Mutex;

    fn simple_definition() -> crate::model::ProcessDefinition {
        ProcessDefinitionBuilder::new("p")
            .start_event("start")
            .task("work")
            .end_event("end")
            .flow("start", "work")
            .flow("work", "end")
            .build()
            .unwrap()
    }

    #[derive(Default)]
    struct RecordingListener {
        calls: Mutex<Vec<String>>,
        reject_kind: Option<&'static str>,
    }

    impl OperationExecutionListener for RecordingListener {
        fn before_execute(&self, _ctx: &CommandContext, op: &Operation) -> Result<(), String> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("before:{}", op.kind()));
            if self.reject_kind == Some(op.kind()) {
                return Err("rejected by test".into());
            }
            Ok(())
        }

        fn after_execute(
            &self,
            _ctx: &CommandContext,
            op: &Operation,
            result: &Result<(), EngineError>,
        ) {
            let tag = if result.is_ok() { "ok" } else { "err" };
            self.calls
                .lock()
                .unwrap()
                .push(format!("after:{}:{tag}", op.kind()));
        }
    }

    fn executor_with_listener(
        listener: Arc<RecordingListener>,
    ) -> (CommandExecutor, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let executor = CommandExecutor::new(
            store.clone(),
            Arc::new(Vec::new()),
            Arc::new(vec![Box::new(listener) as Box<dyn OperationExecutionListener>]),
            false,
        );
        (executor, store)
    }

    #[tokio::test]
    async fn every_operation_is_bracketed_by_listener_calls() {
        let listener = Arc::new(RecordingListener::default());
        let (executor, _store) = executor_with_listener(listener.clone());

        executor
            .execute(&DeployDefinitionCmd {
                definition: simple_definition(),
            })
            .await
            .unwrap();
        executor
            .execute(&StartProcessInstanceCmd::new("p:1"))
            .await
            .unwrap();

        let calls = listener.calls.lock().unwrap().clone();
        assert!(!calls.is_empty());
        let befores = calls.iter().filter(|c| c.starts_with("before:")).count();
        let afters = calls.iter().filter(|c| c.starts_with("after:")).count();
        assert_eq!(befores, afters);
        assert!(calls.iter().all(|c| !c.ends_with(":err")));
    }

    #[tokio::test]
    async fn listener_veto_fails_the_command_and_rolls_back() {
        let listener = Arc::new(RecordingListener {
            calls: Mutex::new(Vec::new()),
            reject_kind: Some("take-outgoing-sequence-flows"),
        });
        let (executor, store) = executor_with_listener(listener.clone());

        executor
            .execute(&DeployDefinitionCmd {
                definition: simple_definition(),
            })
            .await
            .unwrap();
        let err = executor
            .execute(&StartProcessInstanceCmd::new("p:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ListenerRejected { .. }));

        // Nothing from the failed command reached the store.
        assert_eq!(store.execution_count().await, 0);
    }
}
