use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Runtime execution identifier.
pub type ExecutionId = Uuid;

/// Process instance identifier (the id of the instance's root execution).
pub type InstanceId = Uuid;

/// Persisted job identifier.
pub type JobId = Uuid;

// ─── Variable values ──────────────────────────────────────────

/// A process variable. Flat primitives for branching decisions plus an
/// opaque JSON escape hatch for domain payloads the core never inspects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum VariableValue {
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
    Json(serde_json::Value),
}

impl VariableValue {
    pub fn is_truthy(&self) -> bool {
        match self {
            VariableValue::Bool(b) => *b,
            VariableValue::I64(n) => *n != 0,
            VariableValue::F64(n) => *n != 0.0,
            VariableValue::Str(s) => !s.is_empty(),
            VariableValue::Json(v) => !v.is_null(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            VariableValue::I64(n) => Some(*n),
            _ => None,
        }
    }
}

// ─── Executions ───────────────────────────────────────────────

/// What a waiting execution is parked on. A parked execution is only ever
/// resumed by a later command (trigger, job, conditional evaluation) — never
/// by blocking inside the agenda drain loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitKind {
    /// External trigger (user task, receive task).
    Trigger,
    /// Timer job scheduled; fires through the job boundary.
    Timer,
    /// Async continuation job scheduled for this element.
    AsyncContinuation,
    /// Conditional catch event; re-evaluated when variables change.
    Conditional,
    /// Variable listener catch event; fires when the named variable is written.
    VariableListener,
}

/// A runtime pointer into the process graph. One process instance owns a
/// tree of executions: the root (is_process_instance) plus one execution per
/// concurrent path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionEntity {
    pub id: ExecutionId,
    pub process_instance_id: InstanceId,
    pub definition_id: String,
    pub parent_id: Option<ExecutionId>,
    /// Current position in the process graph. None for a fresh root.
    pub element_id: Option<String>,
    /// Inactive executions are parked at a gateway waiting for siblings.
    pub active: bool,
    pub is_process_instance: bool,
    pub is_multi_instance_root: bool,
    pub waiting: Option<WaitKind>,
    pub business_key: Option<String>,
    pub variables: BTreeMap<String, VariableValue>,
    /// Optimistic-lock revision, maintained by the store on commit.
    pub revision: u32,
}

impl ExecutionEntity {
    pub fn new_process_instance(definition_id: &str, business_key: Option<String>) -> Self {
        let id = Uuid::now_v7();
        Self {
            id,
            process_instance_id: id,
            definition_id: definition_id.to_string(),
            parent_id: None,
            element_id: None,
            active: true,
            is_process_instance: true,
            is_multi_instance_root: false,
            waiting: None,
            business_key,
            variables: BTreeMap::new(),
            revision: 0,
        }
    }

    /// Spawn a child execution positioned at `element_id`.
    pub fn new_child(&self, element_id: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            process_instance_id: self.process_instance_id,
            definition_id: self.definition_id.clone(),
            parent_id: Some(self.id),
            element_id: Some(element_id.to_string()),
            active: true,
            is_process_instance: false,
            is_multi_instance_root: false,
            waiting: None,
            business_key: None,
            variables: BTreeMap::new(),
            revision: 0,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.is_some()
    }
}

// ─── Jobs ─────────────────────────────────────────────────────

/// What kind of deferred work a job carries. Jobs are the only way the core
/// expresses "later": the external job executor re-enters the command core
/// to run them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JobKind {
    /// Continue the process at the target execution (async_before elements).
    AsyncContinue,
    /// Trigger the target waiting execution.
    AsyncTrigger,
    /// Timer: due at the given wall-clock time.
    Timer { due_at: DateTime<Utc> },
    /// Asynchronously captured historical facts, JSON-encoded for the
    /// history transformer component.
    History { payload: serde_json::Value },
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::AsyncContinue => "async-continue",
            JobKind::AsyncTrigger => "async-trigger",
            JobKind::Timer { .. } => "timer",
            JobKind::History { .. } => "history",
        }
    }
}

/// A persisted unit of deferred work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEntity {
    pub id: JobId,
    pub kind: JobKind,
    pub execution_id: Option<ExecutionId>,
    pub process_instance_id: Option<InstanceId>,
    pub element_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub retries: u32,
}

impl JobEntity {
    pub fn new(
        kind: JobKind,
        execution_id: Option<ExecutionId>,
        process_instance_id: Option<InstanceId>,
        element_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            execution_id,
            process_instance_id,
            element_id,
            created_at: Utc::now(),
            retries: 3,
        }
    }

    /// Whether the job is ready to run at `now`. Timers wait for their due
    /// date; everything else is due immediately.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match &self.kind {
            JobKind::Timer { due_at } => *due_at <= now,
            _ => true,
        }
    }
}

// ─── Migration ────────────────────────────────────────────────

/// Re-points executions from their current definition onto a target
/// definition before continuing them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MigrationContext {
    pub target_definition_id: String,
    /// source element id → target element id. Unmapped elements keep their id.
    pub element_mapping: BTreeMap<String, String>,
}

impl MigrationContext {
    pub fn mapped_element<'a>(&'a self, element_id: &'a str) -> &'a str {
        self.element_mapping
            .get(element_id)
            .map(String::as_str)
            .unwrap_or(element_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(VariableValue::Bool(true).is_truthy());
        assert!(!VariableValue::I64(0).is_truthy());
        assert!(VariableValue::Str("x".into()).is_truthy());
        assert!(!VariableValue::Json(serde_json::Value::Null).is_truthy());
    }

    #[test]
    fn child_execution_inherits_instance() {
        let root = ExecutionEntity::new_process_instance("order", None);
        let child = root.new_child("start");
        assert_eq!(child.process_instance_id, root.id);
        assert_eq!(child.parent_id, Some(root.id));
        assert!(!child.is_process_instance);
        assert_eq!(child.element_id.as_deref(), Some("start"));
    }

    #[test]
    fn timer_job_due_only_after_deadline() {
        let now = Utc::now();
        let job = JobEntity::new(
            JobKind::Timer {
                due_at: now + chrono::Duration::milliseconds(500),
            },
            None,
            None,
            None,
        );
        assert!(!job.is_due(now));
        assert!(job.is_due(now + chrono::Duration::seconds(1)));
    }

    #[test]
    fn migration_mapping_falls_back_to_identity() {
        let migration = MigrationContext {
            target_definition_id: "v2".into(),
            element_mapping: BTreeMap::from([("a".to_string(), "b".to_string())]),
        };
        assert_eq!(migration.mapped_element("a"), "b");
        assert_eq!(migration.mapped_element("c"), "c");
    }
}
