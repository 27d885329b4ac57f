use thiserror::Error;

use crate::types::FailureKind;

#[derive(Debug, Error)]
pub enum FlowError {
    // Graph errors
    #[error("Invalid flow graph: {0}")]
    Structural(String),

    // Skill errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Node '{node_id}' failed{}: {source}", describe_call(.agent_id, .skill))]
    NodeFailed {
        node_id: String,
        agent_id: Option<String>,
        skill: Option<String>,
        #[source]
        source: Box<FlowError>,
    },

    // Orchestration errors
    #[error("Flow execution timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Node '{node_id}' dispatched more than {limit} times in one execution")]
    VisitLimitExceeded { node_id: String, limit: usize },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Lookup errors
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    // Collaborator errors
    #[error("Rule evaluation failed: {0}")]
    RuleEvaluation(String),

    #[error("Audit sink error: {0}")]
    Audit(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn describe_call(agent_id: &Option<String>, skill: &Option<String>) -> String {
    match (agent_id, skill) {
        (Some(agent), Some(skill)) => format!(" (agent {agent}, skill {skill})"),
        (Some(agent), None) => format!(" (agent {agent})"),
        _ => String::new(),
    }
}

impl FlowError {
    /// Wrap an error with the node (and agent call) it was raised from.
    pub fn at_node(
        self,
        node_id: impl Into<String>,
        agent_id: Option<String>,
        skill: Option<String>,
    ) -> Self {
        FlowError::NodeFailed {
            node_id: node_id.into(),
            agent_id,
            skill,
            source: Box::new(self),
        }
    }

    /// Strip any `NodeFailed` wrappers.
    pub fn root(&self) -> &FlowError {
        match self {
            FlowError::NodeFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Only transient execution errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self.root(), FlowError::Execution(_))
    }

    /// Id of the node an error was attached to, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            FlowError::NodeFailed { node_id, .. } => Some(node_id),
            FlowError::VisitLimitExceeded { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self.root() {
            FlowError::Structural(_) => FailureKind::Structural,
            FlowError::Validation(_) | FlowError::MissingField(_) => FailureKind::Validation,
            FlowError::Execution(_) => FailureKind::Execution,
            FlowError::Timeout { .. } => FailureKind::Timeout,
            _ => FailureKind::Orchestration,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
