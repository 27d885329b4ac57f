use futures::future::BoxFuture;

use crate::error::Result;
use crate::flow::FlowDefinition;
use crate::types::*;

/// Skill execution backend. Performs an agent's unit of work.
pub trait SkillExecutor: Send + Sync + 'static {
    /// Invoke `skill` on `agent_id` with a resolved input payload.
    ///
    /// Implementations report bad input as `FlowError::Validation` or
    /// `FlowError::MissingField`; anything else should be
    /// `FlowError::Execution` so the engine may retry it.
    fn invoke(
        &self,
        tenant_id: &str,
        agent_id: &str,
        skill: &str,
        input: Payload,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// Business rules engine consulted once before traversal.
pub trait RuleEvaluator: Send + Sync + 'static {
    /// Find rules matching the given context.
    fn evaluate(
        &self,
        context: &serde_json::Value,
        entity_type: &str,
        trigger: &str,
    ) -> BoxFuture<'_, Result<Vec<RuleMatch>>>;

    /// Run the actions of matched rules.
    fn execute(
        &self,
        matches: Vec<RuleMatch>,
        context: &serde_json::Value,
    ) -> BoxFuture<'_, Result<ActionResults>>;
}

/// Audit trail sink. Fire-and-forget from the engine's point of view.
pub trait AuditSink: Send + Sync + 'static {
    fn record(&self, event: AuditEvent) -> BoxFuture<'_, Result<()>>;
}

/// Flow and execution persistence backend.
pub trait FlowStore: Send + Sync + 'static {
    /// Insert or replace a flow definition.
    fn save_flow(&self, flow: &FlowDefinition) -> BoxFuture<'_, Result<()>>;

    /// Load a flow scoped to a tenant; `FlowNotFound` otherwise.
    fn load_flow(&self, flow_id: &str, tenant_id: &str) -> BoxFuture<'_, Result<FlowDefinition>>;

    fn create_execution(&self, execution: &FlowExecution) -> BoxFuture<'_, Result<()>>;

    /// Replace a stored execution; `ExecutionNotFound` if it was never created.
    fn update_execution(&self, execution: &FlowExecution) -> BoxFuture<'_, Result<()>>;

    fn get_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<FlowExecution>>;

    /// Executions matching `filter`, newest first.
    fn list_executions(&self, filter: &ExecutionFilter)
        -> BoxFuture<'_, Result<Vec<FlowExecution>>>;

    /// Insert or replace the record for `(execution_id, node_id)`.
    fn upsert_node_execution(&self, node: &NodeExecution) -> BoxFuture<'_, Result<()>>;

    /// Node records of an execution in first-dispatch order.
    fn list_node_executions(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Vec<NodeExecution>>>;
}
