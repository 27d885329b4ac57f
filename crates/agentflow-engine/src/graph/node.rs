use std::time::Duration;

use agentflow_core::error::{FlowError, Result};
use agentflow_core::flow::{NodeKindSpec, NodeSpec, RetryOverride};

use crate::condition::Condition;
use crate::template::{InputTemplate, Reference};

/// A compiled node in the execution graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Unique identifier within the flow.
    pub id: String,
    pub kind: NodeKind,
    /// Replaces the flow-level retry policy when set.
    pub retry: Option<RetryOverride>,
}

/// What a node does when dispatched.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Agent(AgentCall),
    Condition(Condition),
    Delay(Duration),
}

/// An agent skill invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCall {
    pub target: AgentTarget,
    pub skill: String,
    pub input: InputTemplate,
}

/// How the invoked agent is chosen.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentTarget {
    Fixed(String),
    /// Resolved against execution data at dispatch time.
    Selector(Reference),
}

impl Node {
    /// Compile a node declaration, parsing all templates and predicates.
    pub fn compile(spec: &NodeSpec) -> Result<Self> {
        if spec.id.trim().is_empty() {
            return Err(FlowError::Structural("node with empty id".into()));
        }

        let kind = match &spec.kind {
            NodeKindSpec::Agent {
                agent_id,
                agent_selector,
                skill,
                input_template,
            } => {
                let target = match (agent_id, agent_selector) {
                    (Some(id), None) if !id.is_empty() => AgentTarget::Fixed(id.clone()),
                    (None, Some(selector)) => AgentTarget::Selector(
                        Reference::parse_field(selector).map_err(|e| in_node(&spec.id, e))?,
                    ),
                    _ => {
                        return Err(FlowError::Structural(format!(
                            "agent node '{}' needs exactly one of agent_id or agent_selector",
                            spec.id
                        )))
                    }
                };
                if skill.trim().is_empty() {
                    return Err(FlowError::Structural(format!(
                        "agent node '{}' has no skill",
                        spec.id
                    )));
                }
                NodeKind::Agent(AgentCall {
                    target,
                    skill: skill.clone(),
                    input: InputTemplate::compile(input_template)
                        .map_err(|e| in_node(&spec.id, e))?,
                })
            }
            NodeKindSpec::Condition { predicate } => NodeKind::Condition(
                Condition::compile(predicate).map_err(|e| in_node(&spec.id, e))?,
            ),
            NodeKindSpec::Delay { seconds } => NodeKind::Delay(Duration::from_secs(*seconds)),
        };

        Ok(Self {
            id: spec.id.clone(),
            kind,
            retry: spec.retry,
        })
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            NodeKind::Agent(_) => "agent",
            NodeKind::Condition(_) => "condition",
            NodeKind::Delay(_) => "delay",
        }
    }

    /// Agent id and skill for error context; `None` for other node kinds.
    pub fn call_labels(&self) -> (Option<String>, Option<String>) {
        match &self.kind {
            NodeKind::Agent(call) => {
                let agent = match &call.target {
                    AgentTarget::Fixed(id) => id.clone(),
                    AgentTarget::Selector(r) => r.to_string(),
                };
                (Some(agent), Some(call.skill.clone()))
            }
            _ => (None, None),
        }
    }
}

fn in_node(node_id: &str, err: FlowError) -> FlowError {
    match err {
        FlowError::Structural(msg) => FlowError::Structural(format!("node '{}': {}", node_id, msg)),
        other => other,
    }
}
