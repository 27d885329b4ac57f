use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use agentflow_core::error::{FlowError, Result};
use agentflow_core::flow::RetryOverride;
use agentflow_core::traits::SkillExecutor;
use agentflow_core::types::{ExecutionId, NodeExecution, Payload};
use agentflow_core::ExecutionData;

use crate::condition::ConditionEvaluator;
use crate::graph::{AgentCall, AgentTarget, Node, NodeKind};
use crate::recorder::ExecutionRecorder;
use crate::template::TemplateResolver;

/// Resolved retry budget for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first; the node is dispatched at most `max_retries + 1` times.
    pub max_retries: u32,
}

impl RetryPolicy {
    pub const NONE: RetryPolicy = RetryPolicy { max_retries: 0 };

    /// A node-level override replaces the flow-level `(retry_on_failure, retry_count)`.
    pub fn resolve(node: Option<RetryOverride>, flow_enabled: bool, flow_count: u32) -> Self {
        let (enabled, count) = match node {
            Some(o) => (o.enabled, o.count),
            None => (flow_enabled, flow_count),
        };
        Self {
            max_retries: if enabled { count } else { 0 },
        }
    }
}

/// Wait before retrying after failed attempt `attempt` (0-based): `2^attempt` units.
pub fn backoff_delay(attempt: u32, unit: Duration) -> Duration {
    let factor = 1u32 << attempt.min(20);
    unit.saturating_mul(factor)
}

/// Read-only view a node dispatch works against.
pub struct DispatchContext<'a> {
    pub execution_id: &'a ExecutionId,
    pub tenant_id: &'a str,
    pub trigger: &'a Payload,
    /// Execution data as of the start of the current pass.
    pub data: &'a ExecutionData,
}

/// Executes single nodes, applying the retry policy.
pub struct NodeExecutor {
    skills: Arc<dyn SkillExecutor>,
    recorder: ExecutionRecorder,
    backoff_unit: Duration,
}

impl NodeExecutor {
    pub fn new(
        skills: Arc<dyn SkillExecutor>,
        recorder: ExecutionRecorder,
        backoff_unit: Duration,
    ) -> Self {
        Self {
            skills,
            recorder,
            backoff_unit,
        }
    }

    /// Run `node` until it succeeds, fails permanently or exhausts `policy`.
    ///
    /// Every attempt is recorded on `record` before the node does any work.
    /// Validation-class errors are never retried.
    pub async fn execute(
        &self,
        node: &Node,
        policy: RetryPolicy,
        ctx: &DispatchContext<'_>,
        record: &mut NodeExecution,
    ) -> Result<Value> {
        record.input_data = match &node.kind {
            NodeKind::Agent(call) => TemplateResolver::resolve(&call.input, ctx.data, ctx.trigger),
            _ => Payload::new(),
        };

        let mut attempt = 0u32;
        loop {
            self.recorder.attempt_started(record, attempt).await?;
            info!(
                execution_id = %ctx.execution_id,
                node_id = %node.id,
                node_type = node.kind_name(),
                attempt,
                "Dispatching node"
            );

            let started = Instant::now();
            let result = self.dispatch(node, &record.input_data, ctx).await;
            let elapsed = started.elapsed();

            match result {
                Ok(output) => {
                    self.recorder
                        .attempt_completed(record, &output, elapsed)
                        .await?;
                    debug!(
                        node_id = %node.id,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Node completed"
                    );
                    return Ok(output);
                }
                Err(e) => {
                    let retry = e.is_retryable() && attempt < policy.max_retries;
                    self.recorder
                        .attempt_failed(record, &e, elapsed, !retry)
                        .await?;

                    if !retry {
                        error!(node_id = %node.id, attempt, error = %e, "Node failed");
                        return Err(e);
                    }

                    let backoff = backoff_delay(attempt, self.backoff_unit);
                    warn!(
                        node_id = %node.id,
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying node"
                    );
                    self.recorder.retry_scheduled(record, backoff, &e);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn dispatch(&self, node: &Node, input: &Payload, ctx: &DispatchContext<'_>) -> Result<Value> {
        match &node.kind {
            NodeKind::Agent(call) => self.call_agent(node, call, input, ctx).await,
            NodeKind::Condition(condition) => {
                let result = ConditionEvaluator::evaluate(condition, ctx.data, ctx.trigger);
                Ok(json!({ "condition_result": result }))
            }
            NodeKind::Delay(duration) => {
                debug!(node_id = %node.id, seconds = duration.as_secs(), "Delaying");
                tokio::time::sleep(*duration).await;
                Ok(json!({ "delayed_seconds": duration.as_secs() }))
            }
        }
    }

    async fn call_agent(
        &self,
        node: &Node,
        call: &AgentCall,
        input: &Payload,
        ctx: &DispatchContext<'_>,
    ) -> Result<Value> {
        let agent_id = match &call.target {
            AgentTarget::Fixed(id) => id.clone(),
            AgentTarget::Selector(reference) => {
                match TemplateResolver::lookup(reference, ctx.data, ctx.trigger) {
                    Value::String(id) if !id.is_empty() => id,
                    other => {
                        return Err(FlowError::MissingField(format!(
                            "agent_selector {} resolved to {}",
                            reference, other
                        ))
                        .at_node(&node.id, None, Some(call.skill.clone())))
                    }
                }
            }
        };

        self.skills
            .invoke(ctx.tenant_id, &agent_id, &call.skill, input.clone())
            .await
            .map_err(|e| e.at_node(&node.id, Some(agent_id.clone()), Some(call.skill.clone())))
    }
}
