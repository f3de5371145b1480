//! Process definition graph.
//!
//! A deliberately small element set — just enough structure for the agenda
//! operations to act on. Parsing full BPMN XML into this model is the job of
//! an authoring layer, not this core.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::VariableValue;

// ─── Conditions ───────────────────────────────────────────────

/// A guard on a sequence flow or conditional catch event. Evaluated against
/// the resolved variables of the execution taking the flow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowCondition {
    pub variable: String,
    /// None = truthiness test on the variable.
    pub equals: Option<VariableValue>,
}

impl FlowCondition {
    pub fn truthy(variable: &str) -> Self {
        Self {
            variable: variable.to_string(),
            equals: None,
        }
    }

    pub fn equals(variable: &str, value: VariableValue) -> Self {
        Self {
            variable: variable.to_string(),
            equals: Some(value),
        }
    }

    pub fn evaluate(&self, resolved: Option<&VariableValue>) -> bool {
        match (&self.equals, resolved) {
            (Some(expected), Some(actual)) => expected == actual,
            (None, Some(actual)) => actual.is_truthy(),
            (_, None) => false,
        }
    }
}

// ─── Elements and flows ───────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub target: String,
    pub condition: Option<FlowCondition>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ElementKind {
    StartEvent,
    /// A task. `wait_for_trigger` makes it a wait state (user/receive task);
    /// otherwise it completes inline.
    Task { wait_for_trigger: bool },
    ParallelGateway,
    ExclusiveGateway,
    TimerCatchEvent { duration_ms: u64 },
    ConditionalCatchEvent { condition: FlowCondition },
    VariableListenerCatchEvent { variable_name: String },
    EndEvent,
}

/// Parallel or sequential multi-instance marker on a task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultiInstanceSpec {
    pub cardinality: u32,
    pub sequential: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowElement {
    pub id: String,
    pub kind: ElementKind,
    pub outgoing: Vec<SequenceFlow>,
    /// Number of incoming sequence flows — join arity for gateways.
    pub incoming_count: u32,
    /// Break the synchronous continuation here: schedule an async job
    /// instead of executing the element inline.
    pub async_before: bool,
    pub multi_instance: Option<MultiInstanceSpec>,
}

// ─── Definition ───────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Unique deployment id (e.g. "order:3").
    pub id: String,
    pub key: String,
    pub version: u32,
    pub elements: BTreeMap<String, FlowElement>,
    /// Element id of the start event.
    pub initial: String,
}

impl ProcessDefinition {
    pub fn element(&self, id: &str) -> Option<&FlowElement> {
        self.elements.get(id)
    }

    pub fn initial_element(&self) -> Option<&FlowElement> {
        self.elements.get(&self.initial)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("definition `{0}` has no start event")]
    NoStartEvent(String),
    #[error("sequence flow `{flow}` targets unknown element `{target}`")]
    DanglingFlow { flow: String, target: String },
    #[error("duplicate element id `{0}`")]
    DuplicateElement(String),
}

// ─── Builder ──────────────────────────────────────────────────

/// Fluent construction for tests and embedders.
pub struct ProcessDefinitionBuilder {
    id: String,
    key: String,
    version: u32,
    elements: BTreeMap<String, FlowElement>,
    flows: Vec<(String, SequenceFlow)>,
    initial: Option<String>,
    next_flow: u32,
}

impl ProcessDefinitionBuilder {
    pub fn new(key: &str) -> Self {
        Self {
            id: format!("{key}:1"),
            key: key.to_string(),
            version: 1,
            elements: BTreeMap::new(),
            flows: Vec::new(),
            initial: None,
            next_flow: 0,
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self.id = format!("{}:{version}", self.key);
        self
    }

    pub fn element(mut self, id: &str, kind: ElementKind) -> Self {
        if matches!(kind, ElementKind::StartEvent) && self.initial.is_none() {
            self.initial = Some(id.to_string());
        }
        self.elements.insert(
            id.to_string(),
            FlowElement {
                id: id.to_string(),
                kind,
                outgoing: Vec::new(),
                incoming_count: 0,
                async_before: false,
                multi_instance: None,
            },
        );
        self
    }

    pub fn start_event(self, id: &str) -> Self {
        self.element(id, ElementKind::StartEvent)
    }

    pub fn task(self, id: &str) -> Self {
        self.element(
            id,
            ElementKind::Task {
                wait_for_trigger: false,
            },
        )
    }

    pub fn user_task(self, id: &str) -> Self {
        self.element(
            id,
            ElementKind::Task {
                wait_for_trigger: true,
            },
        )
    }

    pub fn parallel_gateway(self, id: &str) -> Self {
        self.element(id, ElementKind::ParallelGateway)
    }

    pub fn exclusive_gateway(self, id: &str) -> Self {
        self.element(id, ElementKind::ExclusiveGateway)
    }

    pub fn end_event(self, id: &str) -> Self {
        self.element(id, ElementKind::EndEvent)
    }

    /// Mark an element as an async continuation point.
    pub fn async_element(mut self, id: &str) -> Self {
        if let Some(element) = self.elements.get_mut(id) {
            element.async_before = true;
        }
        self
    }

    pub fn multi_instance(mut self, id: &str, cardinality: u32, sequential: bool) -> Self {
        if let Some(element) = self.elements.get_mut(id) {
            element.multi_instance = Some(MultiInstanceSpec {
                cardinality,
                sequential,
            });
        }
        self
    }

    pub fn flow(mut self, from: &str, to: &str) -> Self {
        let id = format!("flow_{}", self.next_flow);
        self.next_flow += 1;
        self.flows.push((
            from.to_string(),
            SequenceFlow {
                id,
                target: to.to_string(),
                condition: None,
            },
        ));
        self
    }

    pub fn conditional_flow(mut self, from: &str, to: &str, condition: FlowCondition) -> Self {
        let id = format!("flow_{}", self.next_flow);
        self.next_flow += 1;
        self.flows.push((
            from.to_string(),
            SequenceFlow {
                id,
                target: to.to_string(),
                condition: Some(condition),
            },
        ));
        self
    }

    pub fn build(mut self) -> Result<ProcessDefinition, ModelError> {
        let initial = self
            .initial
            .clone()
            .ok_or_else(|| ModelError::NoStartEvent(self.id.clone()))?;

        for (from, flow) in self.flows {
            if !self.elements.contains_key(&flow.target) {
                return Err(ModelError::DanglingFlow {
                    flow: flow.id,
                    target: flow.target,
                });
            }
            if let Some(target) = self.elements.get_mut(&flow.target) {
                target.incoming_count += 1;
            }
            if let Some(source) = self.elements.get_mut(&from) {
                source.outgoing.push(flow);
            }
        }

        Ok(ProcessDefinition {
            id: self.id,
            key: self.key,
            version: self.version,
            elements: self.elements,
            initial,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_wires_flows_and_counts_incoming() {
        let def = ProcessDefinitionBuilder::new("p")
            .start_event("start")
            .parallel_gateway("fork")
            .task("a")
            .task("b")
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

        assert_eq!(def.initial, "start");
        assert_eq!(def.element("fork").unwrap().outgoing.len(), 2);
        assert_eq!(def.element("join").unwrap().incoming_count, 2);
    }

    #[test]
    fn dangling_flow_is_rejected() {
        let err = ProcessDefinitionBuilder::new("p")
            .start_event("start")
            .flow("start", "missing")
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::DanglingFlow { .. }));
    }

    #[test]
    fn condition_evaluation() {
        let truthy = FlowCondition::truthy("approved");
        assert!(truthy.evaluate(Some(&VariableValue::Bool(true))));
        assert!(!truthy.evaluate(Some(&VariableValue::Bool(false))));
        assert!(!truthy.evaluate(None));

        let eq = FlowCondition::equals("tier", VariableValue::Str("gold".into()));
        assert!(eq.evaluate(Some(&VariableValue::Str("gold".into()))));
        assert!(!eq.evaluate(Some(&VariableValue::Str("silver".into()))));
    }
}
