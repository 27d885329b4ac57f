use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dataset::ExecutionData;

/// JSON object payload (trigger data, node input/output).
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a flow execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node dispatch states share the execution vocabulary.
pub type NodeStatus = ExecutionStatus;

/// Classification of a failed execution, surfaced through `get_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Structural,
    Validation,
    Execution,
    Timeout,
    Orchestration,
}

/// One run of a flow against a trigger payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowExecution {
    pub id: ExecutionId,
    pub flow_id: String,
    pub tenant_id: String,
    /// Opaque caller correlation data.
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub trigger_data: Payload,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub current_node_id: Option<String>,
    /// Node id -> that node's output, accumulated monotonically.
    #[serde(default)]
    pub execution_data: ExecutionData,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub failure_kind: Option<FailureKind>,
    #[serde(default)]
    pub failed_node_id: Option<String>,
    /// Set on executions created by `retry`.
    #[serde(default)]
    pub retry_of: Option<ExecutionId>,
}

impl FlowExecution {
    /// A fresh `pending` execution.
    pub fn new(
        flow_id: impl Into<String>,
        tenant_id: impl Into<String>,
        trigger_data: Payload,
        context: serde_json::Value,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            flow_id: flow_id.into(),
            tenant_id: tenant_id.into(),
            context,
            trigger_data,
            status: ExecutionStatus::Pending,
            current_node_id: None,
            execution_data: ExecutionData::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error_message: None,
            failure_kind: None,
            failed_node_id: None,
            retry_of: None,
        }
    }
}

/// One dispatch attempt of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAttempt {
    pub attempt: u32,
    pub status: NodeStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// Per-node record, one row per `(execution_id, node_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: String,
    pub execution_id: ExecutionId,
    pub node_id: String,
    pub status: NodeStatus,
    /// 0-based index of the latest attempt.
    pub retry_attempt: u32,
    #[serde(default)]
    pub input_data: Payload,
    #[serde(default)]
    pub output_data: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub attempts: Vec<NodeAttempt>,
}

impl NodeExecution {
    pub fn new(execution_id: ExecutionId, node_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            execution_id,
            node_id: node_id.into(),
            status: NodeStatus::Pending,
            retry_attempt: 0,
            input_data: Payload::new(),
            output_data: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            attempts: Vec::new(),
        }
    }
}

/// What `get_status` returns: the execution plus its node history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub execution: FlowExecution,
    pub nodes: Vec<NodeExecution>,
}

impl ExecutionReport {
    pub fn node(&self, node_id: &str) -> Option<&NodeExecution> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }
}

/// Filter for execution queries. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub flow_id: Option<String>,
    pub tenant_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    pub fn matches(&self, execution: &FlowExecution) -> bool {
        self.flow_id.as_ref().map_or(true, |f| *f == execution.flow_id)
            && self
                .tenant_id
                .as_ref()
                .map_or(true, |t| *t == execution.tenant_id)
            && self.status.map_or(true, |s| s == execution.status)
    }
}

/// A business rule that matched the pre-flow context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule_id: String,
    #[serde(default)]
    pub actions: Vec<serde_json::Value>,
}

/// Outcome of executing matched rule actions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResults {
    #[serde(default)]
    pub executed: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Audit trail entry handed to an `AuditSink`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: String,
    pub tenant_id: String,
    pub execution_id: ExecutionId,
    pub flow_id: String,
    #[serde(default)]
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn for_execution(action: impl Into<String>, execution: &FlowExecution) -> Self {
        Self {
            action: action.into(),
            tenant_id: execution.tenant_id.clone(),
            execution_id: execution.id.clone(),
            flow_id: execution.flow_id.clone(),
            detail: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// Traversal began.
    ExecutionStarted {
        execution_id: ExecutionId,
        flow_id: String,
    },
    /// A node attempt was dispatched.
    NodeStarted {
        execution_id: ExecutionId,
        node_id: String,
        attempt: u32,
    },
    /// A node attempt failed and will be retried after `backoff_ms`.
    NodeRetrying {
        execution_id: ExecutionId,
        node_id: String,
        attempt: u32,
        backoff_ms: u64,
        error: String,
    },
    /// A node produced its output.
    NodeCompleted {
        execution_id: ExecutionId,
        node_id: String,
        attempt: u32,
        duration_ms: u64,
    },
    /// A node gave up.
    NodeFailed {
        execution_id: ExecutionId,
        node_id: String,
        attempt: u32,
        error: String,
    },
    /// Traversal finished with an empty frontier.
    ExecutionCompleted {
        execution_id: ExecutionId,
        duration_ms: u64,
    },
    /// Traversal aborted.
    ExecutionFailed {
        execution_id: ExecutionId,
        kind: FailureKind,
        error: String,
    },
}

impl FlowEvent {
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            FlowEvent::ExecutionStarted { execution_id, .. }
            | FlowEvent::NodeStarted { execution_id, .. }
            | FlowEvent::NodeRetrying { execution_id, .. }
            | FlowEvent::NodeCompleted { execution_id, .. }
            | FlowEvent::NodeFailed { execution_id, .. }
            | FlowEvent::ExecutionCompleted { execution_id, .. }
            | FlowEvent::ExecutionFailed { execution_id, .. } => execution_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowEvent::ExecutionCompleted { .. } | FlowEvent::ExecutionFailed { .. }
        )
    }
}
