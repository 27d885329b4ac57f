//! Scripted collaborators and flow builders shared by agentflow tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use agentflow_core::error::{FlowError, Result};
use agentflow_core::flow::{EdgeSpec, FlowDefinition, NodeSpec, Predicate};
use agentflow_core::traits::{AuditSink, RuleEvaluator, SkillExecutor};
use agentflow_core::types::{ActionResults, AuditEvent, Payload, RuleMatch};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Build a `Payload` from a JSON object literal. Non-objects give an empty payload.
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

/// What a scripted skill call returns.
#[derive(Debug, Clone)]
pub enum Outcome {
    Output(Value),
    /// `FlowError::Execution`, retryable.
    Transient(String),
    /// `FlowError::Validation`, never retried.
    Invalid(String),
    /// `FlowError::MissingField`, never retried.
    Missing(String),
    /// Sleep, then return the output.
    Slow(Duration, Value),
}

impl Outcome {
    pub fn output(value: Value) -> Self {
        Self::Output(value)
    }

    pub fn transient(msg: &str) -> Self {
        Self::Transient(msg.to_string())
    }

    pub fn invalid(msg: &str) -> Self {
        Self::Invalid(msg.to_string())
    }

    pub fn missing(field: &str) -> Self {
        Self::Missing(field.to_string())
    }

    pub fn slow(delay: Duration, value: Value) -> Self {
        Self::Slow(delay, value)
    }
}

/// One recorded `SkillExecutor::invoke` call.
#[derive(Debug, Clone)]
pub struct SkillCall {
    pub tenant_id: String,
    pub agent_id: String,
    pub skill: String,
    pub input: Payload,
    /// Tokio clock reading, so paused-time tests can measure backoff.
    pub at: tokio::time::Instant,
}

/// `SkillExecutor` that answers from a per-agent script and logs every call.
///
/// One-shot outcomes queued with `respond_once` are used first, then the
/// agent's repeating `respond` outcome. Unscripted agents echo their call.
#[derive(Default)]
pub struct ScriptedSkillExecutor {
    defaults: Mutex<HashMap<String, Outcome>>,
    queued: Mutex<HashMap<String, VecDeque<Outcome>>>,
    calls: Mutex<Vec<SkillCall>>,
}

impl ScriptedSkillExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, agent_id: &str, outcome: Outcome) -> Self {
        lock(&self.defaults).insert(agent_id.to_string(), outcome);
        self
    }

    pub fn respond_once(self, agent_id: &str, outcome: Outcome) -> Self {
        lock(&self.queued)
            .entry(agent_id.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn calls(&self) -> Vec<SkillCall> {
        lock(&self.calls).clone()
    }

    /// Agent ids in call order.
    pub fn agents_called(&self) -> Vec<String> {
        lock(&self.calls).iter().map(|c| c.agent_id.clone()).collect()
    }

    pub fn call_count(&self, agent_id: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.agent_id == agent_id)
            .count()
    }

    fn next_outcome(&self, agent_id: &str) -> Option<Outcome> {
        if let Some(outcome) = lock(&self.queued)
            .get_mut(agent_id)
            .and_then(|q| q.pop_front())
        {
            return Some(outcome);
        }
        lock(&self.defaults).get(agent_id).cloned()
    }
}

impl SkillExecutor for ScriptedSkillExecutor {
    fn invoke(
        &self,
        tenant_id: &str,
        agent_id: &str,
        skill: &str,
        input: Payload,
    ) -> BoxFuture<'_, Result<Value>> {
        lock(&self.calls).push(SkillCall {
            tenant_id: tenant_id.to_string(),
            agent_id: agent_id.to_string(),
            skill: skill.to_string(),
            input: input.clone(),
            at: tokio::time::Instant::now(),
        });
        let outcome = self.next_outcome(agent_id);
        let echo = json!({ "agent_id": agent_id, "skill": skill, "input": input });

        Box::pin(async move {
            match outcome {
                None => Ok(echo),
                Some(Outcome::Output(value)) => Ok(value),
                Some(Outcome::Transient(msg)) => Err(FlowError::Execution(msg)),
                Some(Outcome::Invalid(msg)) => Err(FlowError::Validation(msg)),
                Some(Outcome::Missing(field)) => Err(FlowError::MissingField(field)),
                Some(Outcome::Slow(delay, value)) => {
                    tokio::time::sleep(delay).await;
                    Ok(value)
                }
            }
        })
    }
}

/// `RuleEvaluator` returning a fixed set of matches and logging contexts.
#[derive(Default)]
pub struct StaticRuleEvaluator {
    matches: Vec<RuleMatch>,
    fail: bool,
    evaluations: Mutex<Vec<Value>>,
    executed: Mutex<Vec<String>>,
}

impl StaticRuleEvaluator {
    /// Every evaluation matches the given rule ids, each with no actions.
    pub fn matching<I, S>(rule_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            matches: rule_ids
                .into_iter()
                .map(|id| RuleMatch {
                    rule_id: id.into(),
                    actions: vec![],
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Both `evaluate` and `execute` fail.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Contexts passed to `evaluate`.
    pub fn evaluations(&self) -> Vec<Value> {
        lock(&self.evaluations).clone()
    }

    /// Rule ids passed to `execute`.
    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }
}

impl RuleEvaluator for StaticRuleEvaluator {
    fn evaluate(
        &self,
        context: &Value,
        _entity_type: &str,
        _trigger: &str,
    ) -> BoxFuture<'_, Result<Vec<RuleMatch>>> {
        lock(&self.evaluations).push(context.clone());
        let result = if self.fail {
            Err(FlowError::RuleEvaluation("rules engine unavailable".into()))
        } else {
            Ok(self.matches.clone())
        };
        Box::pin(async move { result })
    }

    fn execute(
        &self,
        matches: Vec<RuleMatch>,
        _context: &Value,
    ) -> BoxFuture<'_, Result<ActionResults>> {
        let ids: Vec<String> = matches.into_iter().map(|m| m.rule_id).collect();
        lock(&self.executed).extend(ids.iter().cloned());
        let result = if self.fail {
            Err(FlowError::RuleEvaluation("rule actions unavailable".into()))
        } else {
            Ok(ActionResults {
                executed: ids,
                errors: vec![],
            })
        };
        Box::pin(async move { result })
    }
}

/// `AuditSink` that keeps every event.
#[derive(Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        lock(&self.events).clone()
    }

    pub fn actions(&self) -> Vec<String> {
        lock(&self.events).iter().map(|e| e.action.clone()).collect()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, event: AuditEvent) -> BoxFuture<'_, Result<()>> {
        lock(&self.events).push(event);
        Box::pin(async { Ok(()) })
    }
}

/// `AuditSink` that always errors.
pub struct FailingAuditSink;

impl AuditSink for FailingAuditSink {
    fn record(&self, event: AuditEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            Err(FlowError::Audit(format!(
                "cannot record {}: sink offline",
                event.action
            )))
        })
    }
}

/// `A(agent) -> B(condition x == 1) -> C(agent)` plus `A -> D(agent)` guarded by `x != 1`.
///
/// Agents are `agent-a`, `agent-c` and `agent-d`, all with skill `run`.
pub fn branching_flow(tenant_id: &str) -> FlowDefinition {
    FlowDefinition::new("branching", tenant_id)
        .with_node(NodeSpec::agent("A", "agent-a", "run").with_input("x", "${trigger_data.x}"))
        .with_node(NodeSpec::condition(
            "B",
            Predicate::equals("${trigger_data.x}", json!(1)),
        ))
        .with_node(NodeSpec::agent("C", "agent-c", "run").with_input("from_a", "${A.result}"))
        .with_node(NodeSpec::agent("D", "agent-d", "run"))
        .with_edge(EdgeSpec::always("A", "B"))
        .with_edge(EdgeSpec::when(
            "B",
            "C",
            Predicate::equals("${B.condition_result}", json!(true)),
        ))
        .with_edge(EdgeSpec::when(
            "A",
            "D",
            Predicate::not_equals("${trigger_data.x}", json!(1)),
        ))
}

/// One agent node `A` calling `agent_id`, with `retry.count = retries`.
pub fn single_agent_flow(tenant_id: &str, agent_id: &str, retries: u32) -> FlowDefinition {
    FlowDefinition::new("single", tenant_id)
        .with_node(NodeSpec::agent("A", agent_id, "run").with_retry(retries))
}

/// One delay node `A` with an overall timeout.
pub fn delay_flow(tenant_id: &str, seconds: u64, timeout_seconds: u64) -> FlowDefinition {
    FlowDefinition::new("delayed", tenant_id)
        .with_node(NodeSpec::delay("A", seconds))
        .with_timeout(timeout_seconds)
}
