use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use agentflow::{
    EdgeSpec, EngineConfig, EventBus, ExecutionRecorder, ExecutionStatus, FailureKind,
    FlowDefinition, FlowEngine, FlowError, FlowEvent, FlowService, MemoryStore, NodeSpec,
    NodeStatus, Payload, RunMode,
};
use agentflow_test_utils::{
    branching_flow, delay_flow, payload, single_agent_flow, Outcome, RecordingAuditSink,
    ScriptedSkillExecutor,
};

struct Fixture {
    service: FlowService,
    skills: Arc<ScriptedSkillExecutor>,
    audit: Arc<RecordingAuditSink>,
}

fn fixture(skills: ScriptedSkillExecutor, config: EngineConfig) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let skills = Arc::new(skills);
    let audit = Arc::new(RecordingAuditSink::new());
    let recorder =
        ExecutionRecorder::new(store, Arc::new(EventBus::default())).with_audit(audit.clone());
    let engine = FlowEngine::new(config, skills.clone(), recorder);
    Fixture {
        service: FlowService::new(engine),
        skills,
        audit,
    }
}

async fn start(f: &Fixture, flow: &FlowDefinition, trigger: Payload) -> agentflow::ExecutionReport {
    f.service.register_flow(flow).await.unwrap();
    let id = f
        .service
        .start(&flow.id, &flow.tenant_id, trigger, None)
        .await
        .unwrap();
    f.service.get_status(&id).await.unwrap()
}

#[tokio::test]
async fn branch_taken_when_condition_holds() {
    let skills = ScriptedSkillExecutor::new()
        .respond("agent-a", Outcome::output(json!({"result": "extracted"})));
    let f = fixture(skills, EngineConfig::default());

    let report = start(&f, &branching_flow("acme"), payload(json!({"x": 1}))).await;
    let exec = &report.execution;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(f.skills.agents_called(), ["agent-a", "agent-c"]);
    assert_eq!(f.skills.call_count("agent-d"), 0);

    let dispatched: Vec<_> = report.nodes.iter().map(|n| n.node_id.as_str()).collect();
    assert_eq!(dispatched, ["A", "B", "C"]);

    assert!(exec.execution_data.contains("A"));
    assert_eq!(
        exec.execution_data.get("B"),
        Some(&json!({"condition_result": true}))
    );
    assert!(exec.execution_data.contains("C"));
    assert!(!exec.execution_data.contains("D"));

    let c_call = &f.skills.calls()[1];
    assert_eq!(c_call.input["from_a"], json!("extracted"));
    assert_eq!(c_call.tenant_id, "acme");
}

#[tokio::test]
async fn other_branch_taken_when_condition_fails() {
    let f = fixture(ScriptedSkillExecutor::new(), EngineConfig::default());

    let report = start(&f, &branching_flow("acme"), payload(json!({"x": 2}))).await;
    let exec = &report.execution;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(f.skills.call_count("agent-c"), 0);
    assert_eq!(f.skills.call_count("agent-d"), 1);
    assert_eq!(
        exec.execution_data.get("B"),
        Some(&json!({"condition_result": false}))
    );
    assert!(!exec.execution_data.contains("C"));
    assert!(report.node("C").is_none());
}

#[tokio::test(start_paused = true)]
async fn transient_failure_exhausts_retry_budget() {
    let skills =
        ScriptedSkillExecutor::new().respond("flaky", Outcome::transient("connection reset"));
    let f = fixture(skills, EngineConfig::default());

    let report = start(&f, &single_agent_flow("acme", "flaky", 2), Payload::new()).await;
    let exec = &report.execution;

    assert_eq!(f.skills.call_count("flaky"), 3);
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.failure_kind, Some(FailureKind::Execution));
    assert_eq!(exec.failed_node_id.as_deref(), Some("A"));
    let message = exec.error_message.as_deref().unwrap();
    assert!(message.contains("'A'"));
    assert!(message.contains("connection reset"));

    assert_eq!(report.nodes.len(), 1);
    let node = report.node("A").unwrap();
    assert_eq!(node.status, NodeStatus::Failed);
    assert_eq!(node.retry_attempt, 2);
    let attempts: Vec<_> = node.attempts.iter().map(|a| a.attempt).collect();
    assert_eq!(attempts, [0, 1, 2]);
    assert!(node
        .attempts
        .iter()
        .all(|a| a.status == NodeStatus::Failed));
}

#[tokio::test(start_paused = true)]
async fn validation_error_dispatched_once() {
    let skills =
        ScriptedSkillExecutor::new().respond("strict", Outcome::invalid("amount must be positive"));
    let f = fixture(skills, EngineConfig::default());

    let report = start(&f, &single_agent_flow("acme", "strict", 5), Payload::new()).await;
    let exec = &report.execution;

    assert_eq!(f.skills.call_count("strict"), 1);
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.failure_kind, Some(FailureKind::Validation));
    let message = exec.error_message.as_deref().unwrap();
    assert!(message.contains("amount must be positive"));
    assert!(message.contains("agent strict"));
    assert!(message.contains("skill run"));
    assert_eq!(report.node("A").unwrap().attempts.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_field_dispatched_once() {
    let skills = ScriptedSkillExecutor::new().respond("strict", Outcome::missing("vendor_id"));
    let f = fixture(skills, EngineConfig::default());

    let report = start(&f, &single_agent_flow("acme", "strict", 3), Payload::new()).await;

    assert_eq!(f.skills.call_count("strict"), 1);
    assert_eq!(report.execution.failure_kind, Some(FailureKind::Validation));
    assert!(report
        .execution
        .error_message
        .unwrap()
        .contains("vendor_id"));
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_between_attempts() {
    let skills = ScriptedSkillExecutor::new().respond("flaky", Outcome::transient("503"));
    let f = fixture(skills, EngineConfig::default());
    let mut events = f.service.subscribe();

    start(&f, &single_agent_flow("acme", "flaky", 3), Payload::new()).await;

    let calls = f.skills.calls();
    assert_eq!(calls.len(), 4);
    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1].at - w[0].at).collect();
    for (gap, expected_secs) in gaps.iter().zip([1u64, 2, 4]) {
        let expected = Duration::from_secs(expected_secs);
        assert!(*gap >= expected, "gap {:?} shorter than {:?}", gap, expected);
        assert!(*gap < expected + Duration::from_millis(100));
    }

    let mut backoffs = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let FlowEvent::NodeRetrying { backoff_ms, .. } = event {
            backoffs.push(backoff_ms);
        }
    }
    assert_eq!(backoffs, [1000, 2000, 4000]);
    assert!(backoffs.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test(start_paused = true)]
async fn recovers_after_transient_failure() {
    let skills = ScriptedSkillExecutor::new()
        .respond_once("flaky", Outcome::transient("timeout talking to vendor"))
        .respond("flaky", Outcome::output(json!({"ok": true})));
    let f = fixture(skills, EngineConfig::default());

    let report = start(&f, &single_agent_flow("acme", "flaky", 2), Payload::new()).await;

    assert_eq!(report.execution.status, ExecutionStatus::Completed);
    let node = report.node("A").unwrap();
    assert_eq!(node.status, NodeStatus::Completed);
    assert_eq!(node.retry_attempt, 1);
    assert_eq!(node.attempts[0].status, NodeStatus::Failed);
    assert_eq!(node.attempts[1].status, NodeStatus::Completed);
    assert_eq!(node.output_data, Some(json!({"ok": true})));
}

#[tokio::test(start_paused = true)]
async fn engine_retry_defaults_apply_unless_flow_overrides() {
    let config = EngineConfig {
        default_retry_on_failure: true,
        default_retry_count: 1,
        ..Default::default()
    };

    let skills = ScriptedSkillExecutor::new()
        .respond_once("flaky", Outcome::transient("blip"))
        .respond("flaky", Outcome::output(json!({"ok": true})));
    let f = fixture(skills, config.clone());
    let flow =
        FlowDefinition::new("defaults", "acme").with_node(NodeSpec::agent("A", "flaky", "run"));
    let report = start(&f, &flow, Payload::new()).await;
    assert_eq!(report.execution.status, ExecutionStatus::Completed);
    assert_eq!(f.skills.call_count("flaky"), 2);

    let skills = ScriptedSkillExecutor::new()
        .respond_once("flaky", Outcome::transient("blip"))
        .respond("flaky", Outcome::output(json!({"ok": true})));
    let f = fixture(skills, config);
    let flow = FlowDefinition::new("no-retry", "acme")
        .with_node(NodeSpec::agent("A", "flaky", "run"))
        .with_retry(false, 0);
    let report = start(&f, &flow, Payload::new()).await;
    assert_eq!(report.execution.status, ExecutionStatus::Failed);
    assert_eq!(f.skills.call_count("flaky"), 1);
}

#[tokio::test(start_paused = true)]
async fn delay_longer_than_timeout_fails() {
    let f = fixture(ScriptedSkillExecutor::new(), EngineConfig::default());
    let began = tokio::time::Instant::now();

    let report = start(&f, &delay_flow("acme", 5, 1), Payload::new()).await;
    let exec = &report.execution;

    assert!(began.elapsed() < Duration::from_secs(5));
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.failure_kind, Some(FailureKind::Timeout));
    assert!(exec.error_message.as_deref().unwrap().contains("timed out"));
    assert!(exec.execution_data.is_empty());
    assert!(exec.completed_at.is_some());

    let node = report.node("A").unwrap();
    assert_ne!(node.status, NodeStatus::Completed);
    assert!(matches!(node.status, NodeStatus::Failed | NodeStatus::Running));
}

#[tokio::test(start_paused = true)]
async fn timeout_keeps_completed_nodes() {
    let f = fixture(
        ScriptedSkillExecutor::new().respond("fast", Outcome::output(json!({"v": 1}))),
        EngineConfig::default(),
    );
    let flow = FlowDefinition::new("partial", "acme")
        .with_node(NodeSpec::agent("A", "fast", "run"))
        .with_node(NodeSpec::delay("B", 10))
        .with_node(NodeSpec::agent("C", "never", "run"))
        .with_edge(EdgeSpec::always("A", "B"))
        .with_edge(EdgeSpec::always("B", "C"))
        .with_timeout(3);

    let report = start(&f, &flow, Payload::new()).await;
    let exec = &report.execution;

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.failure_kind, Some(FailureKind::Timeout));
    assert_eq!(exec.failed_node_id.as_deref(), Some("B"));
    assert_eq!(exec.execution_data.node_ids().collect::<Vec<_>>(), ["A"]);
    assert_eq!(f.skills.call_count("never"), 0);
    assert_eq!(report.node("B").unwrap().status, NodeStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn retry_never_mutates_original() {
    let f = fixture(ScriptedSkillExecutor::new(), EngineConfig::default());
    let report = start(&f, &delay_flow("acme", 5, 1), payload(json!({"ticket": 42}))).await;
    let original_id = report.execution.id.clone();

    let new_id = f.service.retry(&original_id).await.unwrap();
    let again = f.service.retry(&original_id).await.unwrap();

    assert_ne!(new_id, original_id);
    assert_ne!(again, new_id);

    let after = f.service.get_status(&original_id).await.unwrap();
    assert_eq!(after.execution, report.execution);
    assert_eq!(after.nodes, report.nodes);

    let retried = f.service.get_status(&new_id).await.unwrap().execution;
    assert_eq!(retried.retry_of.as_ref(), Some(&original_id));
    assert_eq!(retried.trigger_data, report.execution.trigger_data);
    assert_eq!(
        f.audit
            .actions()
            .iter()
            .filter(|a| *a == "flow_execution_retried")
            .count(),
        2
    );
}

#[tokio::test]
async fn retry_rejects_completed_execution() {
    let f = fixture(ScriptedSkillExecutor::new(), EngineConfig::default());
    let report = start(&f, &single_agent_flow("acme", "ok", 0), Payload::new()).await;
    assert_eq!(report.execution.status, ExecutionStatus::Completed);

    let err = f.service.retry(&report.execution.id).await.unwrap_err();
    assert!(matches!(err, FlowError::InvalidState(_)));
}

#[tokio::test]
async fn selector_picks_agent_from_trigger() {
    let f = fixture(ScriptedSkillExecutor::new(), EngineConfig::default());
    let flow = FlowDefinition::new("routed", "acme").with_node(
        NodeSpec::selected_agent("A", "${trigger_data.reviewer}", "review")
            .with_input("doc", "${trigger_data.doc}"),
    );

    let report = start(&f, &flow, payload(json!({"reviewer": "legal-bot", "doc": "msa.pdf"}))).await;
    assert_eq!(report.execution.status, ExecutionStatus::Completed);
    assert_eq!(f.skills.agents_called(), ["legal-bot"]);
    assert_eq!(f.skills.calls()[0].input["doc"], json!("msa.pdf"));
    assert_eq!(
        report.node("A").unwrap().input_data["doc"],
        json!("msa.pdf")
    );
}

#[tokio::test]
async fn unresolved_selector_is_validation_failure() {
    let f = fixture(ScriptedSkillExecutor::new(), EngineConfig::default());
    let flow = FlowDefinition::new("routed", "acme")
        .with_node(NodeSpec::selected_agent("A", "${trigger_data.reviewer}", "review"))
        .with_retry(true, 3);

    let report = start(&f, &flow, Payload::new()).await;
    assert!(f.skills.calls().is_empty());
    assert_eq!(report.execution.status, ExecutionStatus::Failed);
    assert_eq!(report.execution.failure_kind, Some(FailureKind::Validation));
    assert_eq!(report.node("A").unwrap().attempts.len(), 1);
}

#[tokio::test]
async fn unresolved_template_becomes_null() {
    let f = fixture(ScriptedSkillExecutor::new(), EngineConfig::default());
    let flow = FlowDefinition::new("lenient", "acme").with_node(
        NodeSpec::agent("A", "tolerant", "run")
            .with_input("optional", "${trigger_data.missing}")
            .with_input("ghost", "${nowhere.field}")
            .with_input("literal", "plain text")
            .with_input("count", 3),
    );

    let report = start(&f, &flow, Payload::new()).await;
    assert_eq!(report.execution.status, ExecutionStatus::Completed);
    let input = &f.skills.calls()[0].input;
    assert_eq!(input["optional"], serde_json::Value::Null);
    assert_eq!(input["ghost"], serde_json::Value::Null);
    assert_eq!(input["literal"], json!("plain text"));
    assert_eq!(input["count"], json!(3));
}

#[tokio::test]
async fn flow_without_entry_node_rejected() {
    let f = fixture(ScriptedSkillExecutor::new(), EngineConfig::default());
    let flow = FlowDefinition::new("circular", "acme")
        .with_node(NodeSpec::agent("A", "x", "run"))
        .with_node(NodeSpec::agent("B", "x", "run"))
        .with_edge(EdgeSpec::always("A", "B"))
        .with_edge(EdgeSpec::always("B", "A"));

    let err = f.service.register_flow(&flow).await.unwrap_err();
    assert!(matches!(err, FlowError::Structural(_)));
}

#[tokio::test(start_paused = true)]
async fn background_execution_is_pollable() {
    let skills = ScriptedSkillExecutor::new()
        .respond("slow", Outcome::slow(Duration::from_secs(2), json!({"done": true})));
    let f = fixture(skills, EngineConfig::default());
    let service = f.service.with_mode(RunMode::Background);
    let flow = single_agent_flow("acme", "slow", 0);
    service.register_flow(&flow).await.unwrap();

    let id = service
        .start(&flow.id, "acme", Payload::new(), None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let mid = service.get_status(&id).await.unwrap().execution;
    assert_eq!(mid.status, ExecutionStatus::Running);
    assert_eq!(mid.current_node_id.as_deref(), Some("A"));

    let mut status = mid.status;
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        status = service.get_status(&id).await.unwrap().execution.status;
        if status.is_terminal() {
            break;
        }
    }
    assert_eq!(status, ExecutionStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn concurrent_executions_keep_separate_data() {
    let f = fixture(ScriptedSkillExecutor::new(), EngineConfig::default());
    let service = f.service.with_mode(RunMode::Background);
    let flow = FlowDefinition::new("echo", "acme")
        .with_node(NodeSpec::delay("wait", 1))
        .with_node(NodeSpec::agent("A", "echo", "run").with_input("n", "${trigger_data.n}"))
        .with_edge(EdgeSpec::always("wait", "A"));
    service.register_flow(&flow).await.unwrap();

    let first = service
        .start("echo", "acme", payload(json!({"n": 1})), None)
        .await
        .unwrap();
    let second = service
        .start("echo", "acme", payload(json!({"n": 2})), None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;

    for (id, n) in [(first, 1), (second, 2)] {
        let exec = service.get_status(&id).await.unwrap().execution;
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.execution_data.field("A", "input"), Some(&json!({"n": n})));
    }
}

#[tokio::test]
async fn events_bracket_the_execution() {
    let f = fixture(ScriptedSkillExecutor::new(), EngineConfig::default());
    let mut events = f.service.subscribe();

    let report = start(&f, &branching_flow("acme"), payload(json!({"x": 1}))).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.execution_id(), &report.execution.id);
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(FlowEvent::ExecutionStarted { .. })));
    assert!(matches!(seen.last(), Some(FlowEvent::ExecutionCompleted { .. })));
    let completed_nodes = seen
        .iter()
        .filter(|e| matches!(e, FlowEvent::NodeCompleted { .. }))
        .count();
    assert_eq!(completed_nodes, 3);
    assert_eq!(
        f.audit.actions(),
        ["flow_execution_started", "flow_execution_completed"]
    );
}
