use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use agentflow_core::config::EngineConfig;
use agentflow_core::error::{FlowError, Result};
use agentflow_core::flow::FlowDefinition;
use agentflow_core::traits::{RuleEvaluator, SkillExecutor};
use agentflow_core::types::{FlowExecution, NodeExecution};
use agentflow_core::ExecutionData;

use crate::executor::{DispatchContext, NodeExecutor, RetryPolicy};
use crate::graph::GraphModel;
use crate::recorder::ExecutionRecorder;

/// Mutable state of one execution while it is being driven.
struct Run {
    execution: FlowExecution,
    node_records: HashMap<String, NodeExecution>,
    visits: HashMap<String, usize>,
    /// Node whose dispatch has started but not returned.
    in_flight: Option<String>,
}

impl Run {
    fn new(execution: FlowExecution) -> Self {
        Self {
            execution,
            node_records: HashMap::new(),
            visits: HashMap::new(),
            in_flight: None,
        }
    }
}

/// Drives a flow execution over its graph, pass by pass.
///
/// Each pass dispatches the ready part of the frontier against a snapshot of
/// the execution data taken when the pass starts, then follows every
/// satisfied outgoing edge of the nodes it ran. A node reachable from another
/// pending node is held back until that node has run, so a join never fires
/// before all of its activated predecessors.
pub struct FlowEngine {
    config: EngineConfig,
    recorder: ExecutionRecorder,
    executor: NodeExecutor,
    rules: Option<Arc<dyn RuleEvaluator>>,
}

impl FlowEngine {
    pub fn new(
        config: EngineConfig,
        skills: Arc<dyn SkillExecutor>,
        recorder: ExecutionRecorder,
    ) -> Self {
        let executor = NodeExecutor::new(skills, recorder.clone(), config.backoff_unit());
        Self {
            config,
            recorder,
            executor,
            rules: None,
        }
    }

    pub fn with_rules(mut self, rules: Arc<dyn RuleEvaluator>) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn recorder(&self) -> &ExecutionRecorder {
        &self.recorder
    }

    /// Compile a flow definition into a graph, applying the cycle policy.
    pub fn prepare(&self, flow: &FlowDefinition) -> Result<GraphModel> {
        let graph = GraphModel::build(flow)?;
        if self.config.reject_cycles {
            graph.ensure_acyclic()?;
        } else if graph.has_cycle() {
            debug!(
                flow_id = %flow.id,
                max_node_visits = self.config.max_node_visits,
                "Flow contains a cycle"
            );
        }
        Ok(graph)
    }

    /// Flow timeout, falling back to the engine default (0 = none).
    pub fn timeout_for(&self, graph: &GraphModel) -> Option<Duration> {
        graph.timeout().or_else(|| {
            (self.config.default_timeout_secs > 0)
                .then(|| Duration::from_secs(self.config.default_timeout_secs))
        })
    }

    /// Drive a persisted `pending` execution to a terminal state.
    ///
    /// Node and timeout failures end up on the returned execution, not in
    /// `Err`; an error is returned only when the state itself cannot be
    /// recorded.
    pub async fn run(&self, graph: &GraphModel, execution: FlowExecution) -> Result<FlowExecution> {
        let mut run = Run::new(execution);
        self.recorder.mark_running(&mut run.execution).await?;
        info!(
            execution_id = %run.execution.id,
            flow_id = %run.execution.flow_id,
            tenant_id = %run.execution.tenant_id,
            "Flow execution started"
        );

        self.evaluate_rules(&run.execution).await;

        let outcome = match self.timeout_for(graph) {
            Some(limit) => {
                match tokio::time::timeout(limit, self.traverse(graph, &mut run)).await {
                    Ok(result) => result,
                    Err(_) => Err(FlowError::Timeout {
                        timeout_secs: limit.as_secs(),
                    }),
                }
            }
            None => self.traverse(graph, &mut run).await,
        };

        match outcome {
            Ok(()) => {
                self.recorder.complete(&mut run.execution).await?;
                info!(
                    execution_id = %run.execution.id,
                    nodes = run.execution.execution_data.len(),
                    duration_ms = run.execution.duration_ms.unwrap_or(0),
                    "Flow execution completed"
                );
            }
            Err(e) => {
                if let Some(node_id) = run.in_flight.take() {
                    if let Some(record) = run.node_records.get_mut(&node_id) {
                        if let Err(save_err) = self.recorder.abort_node(record, &e).await {
                            warn!(node_id = %node_id, error = %save_err, "Failed to record aborted node");
                        }
                    }
                }
                self.recorder.fail(&mut run.execution, &e).await?;
                error!(
                    execution_id = %run.execution.id,
                    kind = ?e.failure_kind(),
                    node_id = run.execution.failed_node_id.as_deref().unwrap_or("-"),
                    error = %e,
                    "Flow execution failed"
                );
            }
        }

        Ok(run.execution)
    }

    async fn traverse(&self, graph: &GraphModel, run: &mut Run) -> Result<()> {
        let mut pending: Vec<String> = graph.start_nodes().to_vec();
        let mut pass = 0usize;

        while !pending.is_empty() {
            pass += 1;
            let ready = ready_nodes(graph, &pending);
            pending.retain(|id| !ready.contains(id));
            debug!(
                execution_id = %run.execution.id,
                pass,
                ready = ?ready,
                deferred = pending.len(),
                "Traversal pass"
            );

            let snapshot = run.execution.execution_data.snapshot();
            for node_id in &ready {
                self.dispatch(graph, run, node_id, &snapshot).await?;
            }

            for node_id in &ready {
                for edge in graph.outgoing(node_id) {
                    if !edge.is_satisfied(&run.execution.execution_data, &run.execution.trigger_data)
                    {
                        debug!(from = %edge.from, to = %edge.to, "Edge condition not met");
                        continue;
                    }
                    if !pending.contains(&edge.to) {
                        pending.push(edge.to.clone());
                    }
                }
            }
        }

        Ok(())
    }

    async fn dispatch(
        &self,
        graph: &GraphModel,
        run: &mut Run,
        node_id: &str,
        snapshot: &ExecutionData,
    ) -> Result<()> {
        let node = graph.node(node_id).ok_or_else(|| {
            FlowError::Structural(format!("node '{}' not found in graph", node_id))
        })?;

        let visits = run.visits.entry(node_id.to_string()).or_insert(0);
        *visits += 1;
        if *visits > self.config.max_node_visits {
            warn!(
                node_id = %node_id,
                limit = self.config.max_node_visits,
                "Node visit limit reached, terminating flow"
            );
            return Err(FlowError::VisitLimitExceeded {
                node_id: node_id.to_string(),
                limit: self.config.max_node_visits,
            });
        }

        run.execution.current_node_id = Some(node_id.to_string());
        self.recorder.save(&run.execution).await?;

        let policy = RetryPolicy::resolve(
            node.retry,
            graph
                .retry_on_failure()
                .unwrap_or(self.config.default_retry_on_failure),
            graph
                .retry_count()
                .unwrap_or(self.config.default_retry_count),
        );

        run.in_flight = Some(node_id.to_string());
        let execution_id = &run.execution.id;
        let record = run
            .node_records
            .entry(node_id.to_string())
            .or_insert_with(|| NodeExecution::new(execution_id.clone(), node_id));
        let ctx = DispatchContext {
            execution_id,
            tenant_id: &run.execution.tenant_id,
            trigger: &run.execution.trigger_data,
            data: snapshot,
        };
        let output = self.executor.execute(node, policy, &ctx, record).await?;
        run.in_flight = None;

        run.execution.execution_data.record(node_id, output);
        self.recorder.save(&run.execution).await
    }

    /// Advisory pre-flow rule pass. Failures are logged and ignored.
    async fn evaluate_rules(&self, execution: &FlowExecution) {
        let Some(rules) = &self.rules else {
            return;
        };
        let context = rule_context(execution);

        let matches = match rules
            .evaluate(&context, &self.config.rule_entity_type, &self.config.rule_trigger)
            .await
        {
            Ok(matches) => matches,
            Err(e) => {
                warn!(execution_id = %execution.id, error = %e, "Rule evaluation failed, continuing");
                return;
            }
        };
        if matches.is_empty() {
            return;
        }

        let matched = matches.len();
        match rules.execute(matches, &context).await {
            Ok(results) => info!(
                execution_id = %execution.id,
                matched,
                executed = results.executed.len(),
                errors = results.errors.len(),
                "Pre-flow rules applied"
            ),
            Err(e) => {
                warn!(execution_id = %execution.id, error = %e, "Rule actions failed, continuing")
            }
        }
    }
}

/// Pending nodes that no other pending node can still lead to.
///
/// When every pending node waits on another, the nodes whose only blockers
/// sit on a cycle with them are released. Nodes downstream of that cycle
/// stay deferred.
fn ready_nodes(graph: &GraphModel, pending: &[String]) -> Vec<String> {
    let ready: Vec<String> = pending
        .iter()
        .filter(|candidate| {
            !pending
                .iter()
                .any(|other| other != *candidate && graph.reaches(other, candidate))
        })
        .cloned()
        .collect();

    if !ready.is_empty() {
        return ready;
    }

    pending
        .iter()
        .filter(|candidate| {
            pending.iter().all(|other| {
                other == *candidate
                    || !graph.reaches(other, candidate)
                    || graph.reaches(candidate, other)
            })
        })
        .cloned()
        .collect()
}

/// Execution context merged with the trigger payload, as seen by the rules engine.
fn rule_context(execution: &FlowExecution) -> Value {
    let mut ctx = match &execution.context {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("context".to_string(), other.clone());
            map
        }
    };
    ctx.insert("execution_id".to_string(), json!(execution.id));
    ctx.insert("flow_id".to_string(), json!(execution.flow_id));
    ctx.insert("tenant_id".to_string(), json!(execution.tenant_id));
    ctx.insert(
        "trigger_data".to_string(),
        Value::Object(execution.trigger_data.clone()),
    );
    Value::Object(ctx)
}
