//! Declarative flow definitions as stored and loaded by a `FlowStore`.
//!
//! These types carry no behaviour beyond builders; the engine compiles a
//! `FlowDefinition` into its own graph model before running it.

use serde::{Deserialize, Serialize};

use crate::types::Payload;

/// Publication state of a flow. Only `active` flows can be started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    #[default]
    Draft,
    Active,
    Archived,
}

impl FlowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }
}

/// A tenant-scoped directed graph of nodes and edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: FlowStatus,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    /// Overall wall-clock budget for one execution. `0` means no budget.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Flow-level retry defaults; `None` defers to engine config.
    #[serde(default)]
    pub retry_on_failure: Option<bool>,
    #[serde(default)]
    pub retry_count: Option<u32>,
}

impl FlowDefinition {
    /// Create an empty, active flow.
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            tenant_id: tenant_id.into(),
            status: FlowStatus::Active,
            nodes: vec![],
            edges: vec![],
            timeout_seconds: None,
            retry_on_failure: None,
            retry_count: None,
        }
    }

    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: EdgeSpec) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_status(mut self, status: FlowStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Set flow-level retry defaults.
    pub fn with_retry(mut self, enabled: bool, count: u32) -> Self {
        self.retry_on_failure = Some(enabled);
        self.retry_count = Some(count);
        self
    }
}

/// A node declaration: id, type-specific payload and an optional retry override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKindSpec,
    #[serde(default)]
    pub retry: Option<RetryOverride>,
}

/// Type-tagged node payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKindSpec {
    /// Invoke an agent skill.
    Agent {
        #[serde(default)]
        agent_id: Option<String>,
        /// Template reference resolved at dispatch time to an agent id.
        #[serde(default)]
        agent_selector: Option<String>,
        skill: String,
        #[serde(default)]
        input_template: Payload,
    },
    /// Evaluate a predicate into `{condition_result: bool}`.
    Condition { predicate: Predicate },
    /// Suspend for a number of seconds.
    Delay { seconds: u64 },
}

impl NodeSpec {
    pub fn agent(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        skill: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: NodeKindSpec::Agent {
                agent_id: Some(agent_id.into()),
                agent_selector: None,
                skill: skill.into(),
                input_template: Payload::new(),
            },
            retry: None,
        }
    }

    /// Agent node whose agent id comes from a template reference.
    pub fn selected_agent(
        id: impl Into<String>,
        selector: impl Into<String>,
        skill: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: NodeKindSpec::Agent {
                agent_id: None,
                agent_selector: Some(selector.into()),
                skill: skill.into(),
                input_template: Payload::new(),
            },
            retry: None,
        }
    }

    pub fn condition(id: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            id: id.into(),
            kind: NodeKindSpec::Condition { predicate },
            retry: None,
        }
    }

    pub fn delay(id: impl Into<String>, seconds: u64) -> Self {
        Self {
            id: id.into(),
            kind: NodeKindSpec::Delay { seconds },
            retry: None,
        }
    }

    /// Add an input template entry. No-op for non-agent nodes.
    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        if let NodeKindSpec::Agent { input_template, .. } = &mut self.kind {
            input_template.insert(key.into(), value.into());
        }
        self
    }

    /// Override the flow-level retry policy for this node.
    pub fn with_retry(mut self, count: u32) -> Self {
        self.retry = Some(RetryOverride {
            enabled: true,
            count,
        });
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.retry = Some(RetryOverride {
            enabled: false,
            count: 0,
        });
        self
    }
}

/// Per-node retry policy; replaces the flow-level defaults when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOverride {
    #[serde(default = "default_retry_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub count: u32,
}

fn default_retry_enabled() -> bool {
    true
}

/// A directed edge, optionally guarded by a predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: Option<Predicate>,
}

impl EdgeSpec {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    /// Create an edge taken only when `predicate` holds.
    pub fn when(from: impl Into<String>, to: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: Some(predicate),
        }
    }
}

/// A binary comparison between a field reference and a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    /// `NODE.FIELD`, `trigger_data.FIELD` or a bare key, with or without `${}`.
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl Predicate {
    pub fn new(
        field: impl Into<String>,
        operator: Operator,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self::new(field, Operator::Equals, value)
    }

    pub fn not_equals(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self::new(field, Operator::NotEquals, value)
    }

    pub fn greater_than(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self::new(field, Operator::GreaterThan, value)
    }

    pub fn less_than(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self::new(field, Operator::LessThan, value)
    }
}

/// Comparison operator. Unknown names are kept as `Unsupported` and never match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Unsupported(String),
}

impl From<String> for Operator {
    fn from(s: String) -> Self {
        match s.as_str() {
            "equals" => Operator::Equals,
            "not_equals" => Operator::NotEquals,
            "greater_than" => Operator::GreaterThan,
            "less_than" => Operator::LessThan,
            _ => Operator::Unsupported(s),
        }
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        match op {
            Operator::Equals => "equals".to_string(),
            Operator::NotEquals => "not_equals".to_string(),
            Operator::GreaterThan => "greater_than".to_string(),
            Operator::LessThan => "less_than".to_string(),
            Operator::Unsupported(s) => s,
        }
    }
}
