use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use agentflow_core::error::{FlowError, Result};
use agentflow_core::event::EventBus;
use agentflow_core::traits::{AuditSink, FlowStore};
use agentflow_core::types::*;

/// Persists execution and node state transitions and publishes them as events.
///
/// Every write is awaited before the engine reaches its next suspension point
/// or external call, so a poller always sees the node currently in flight.
#[derive(Clone)]
pub struct ExecutionRecorder {
    store: Arc<dyn FlowStore>,
    events: Arc<EventBus>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl ExecutionRecorder {
    pub fn new(store: Arc<dyn FlowStore>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            events,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub async fn create(&self, execution: &FlowExecution) -> Result<()> {
        self.store.create_execution(execution).await?;
        debug!(execution_id = %execution.id, flow_id = %execution.flow_id, "Execution created");
        Ok(())
    }

    /// `pending -> running`.
    pub async fn mark_running(&self, execution: &mut FlowExecution) -> Result<()> {
        if execution.status != ExecutionStatus::Pending {
            return Err(FlowError::InvalidState(format!(
                "execution {} is {}, expected pending",
                execution.id, execution.status
            )));
        }
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        self.store.update_execution(execution).await?;

        self.events.publish(FlowEvent::ExecutionStarted {
            execution_id: execution.id.clone(),
            flow_id: execution.flow_id.clone(),
        });
        self.audit(AuditEvent::for_execution("flow_execution_started", execution))
            .await;
        Ok(())
    }

    /// Persist the execution as-is (current node, partial execution data).
    pub async fn save(&self, execution: &FlowExecution) -> Result<()> {
        self.store.update_execution(execution).await
    }

    /// A node attempt is about to be dispatched.
    pub async fn attempt_started(&self, record: &mut NodeExecution, attempt: u32) -> Result<()> {
        let now = Utc::now();
        record.status = NodeStatus::Running;
        record.retry_attempt = attempt;
        record.error_message = None;
        record.completed_at = None;
        record.duration_ms = None;
        if record.started_at.is_none() {
            record.started_at = Some(now);
        }
        record.attempts.push(NodeAttempt {
            attempt,
            status: NodeStatus::Running,
            error_message: None,
            started_at: now,
            completed_at: None,
            duration_ms: None,
        });
        self.store.upsert_node_execution(record).await?;

        self.events.publish(FlowEvent::NodeStarted {
            execution_id: record.execution_id.clone(),
            node_id: record.node_id.clone(),
            attempt,
        });
        Ok(())
    }

    pub async fn attempt_completed(
        &self,
        record: &mut NodeExecution,
        output: &serde_json::Value,
        elapsed: Duration,
    ) -> Result<()> {
        let duration_ms = elapsed.as_millis() as u64;
        close_attempt(record, NodeStatus::Completed, None, duration_ms);
        record.output_data = Some(output.clone());
        self.store.upsert_node_execution(record).await?;

        self.events.publish(FlowEvent::NodeCompleted {
            execution_id: record.execution_id.clone(),
            node_id: record.node_id.clone(),
            attempt: record.retry_attempt,
            duration_ms,
        });
        Ok(())
    }

    /// Record a failed attempt. `final_attempt` is false when a retry follows.
    pub async fn attempt_failed(
        &self,
        record: &mut NodeExecution,
        error: &FlowError,
        elapsed: Duration,
        final_attempt: bool,
    ) -> Result<()> {
        let message = error.to_string();
        close_attempt(
            record,
            NodeStatus::Failed,
            Some(message.clone()),
            elapsed.as_millis() as u64,
        );
        self.store.upsert_node_execution(record).await?;

        if final_attempt {
            self.events.publish(FlowEvent::NodeFailed {
                execution_id: record.execution_id.clone(),
                node_id: record.node_id.clone(),
                attempt: record.retry_attempt,
                error: message,
            });
        }
        Ok(())
    }

    pub fn retry_scheduled(&self, record: &NodeExecution, backoff: Duration, error: &FlowError) {
        self.events.publish(FlowEvent::NodeRetrying {
            execution_id: record.execution_id.clone(),
            node_id: record.node_id.clone(),
            attempt: record.retry_attempt,
            backoff_ms: backoff.as_millis() as u64,
            error: error.to_string(),
        });
    }

    /// Mark a node that was cut off mid-dispatch (e.g. by the flow timeout).
    pub async fn abort_node(&self, record: &mut NodeExecution, error: &FlowError) -> Result<()> {
        if record.status != NodeStatus::Running {
            return Ok(());
        }
        let elapsed = record
            .attempts
            .last()
            .map(|a| (Utc::now() - a.started_at).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        close_attempt(record, NodeStatus::Failed, Some(error.to_string()), elapsed);
        self.store.upsert_node_execution(record).await
    }

    /// `running -> completed`.
    pub async fn complete(&self, execution: &mut FlowExecution) -> Result<()> {
        let now = Utc::now();
        execution.status = ExecutionStatus::Completed;
        execution.current_node_id = None;
        execution.completed_at = Some(now);
        execution.duration_ms = Some(elapsed_ms(execution));
        self.store.update_execution(execution).await?;

        self.events.publish(FlowEvent::ExecutionCompleted {
            execution_id: execution.id.clone(),
            duration_ms: execution.duration_ms.unwrap_or(0),
        });
        self.audit(
            AuditEvent::for_execution("flow_execution_completed", execution).with_detail(
                serde_json::json!({ "nodes_completed": execution.execution_data.len() }),
            ),
        )
        .await;
        Ok(())
    }

    /// `pending | running -> failed`. Partial execution data is kept.
    pub async fn fail(&self, execution: &mut FlowExecution, error: &FlowError) -> Result<()> {
        let kind = error.failure_kind();
        execution.status = ExecutionStatus::Failed;
        execution.completed_at = Some(Utc::now());
        execution.duration_ms = Some(elapsed_ms(execution));
        execution.error_message = Some(error.to_string());
        execution.failure_kind = Some(kind);
        execution.failed_node_id = error
            .node_id()
            .map(str::to_string)
            .or_else(|| execution.current_node_id.clone());
        self.store.update_execution(execution).await?;

        self.events.publish(FlowEvent::ExecutionFailed {
            execution_id: execution.id.clone(),
            kind,
            error: error.to_string(),
        });
        self.audit(
            AuditEvent::for_execution("flow_execution_failed", execution).with_detail(
                serde_json::json!({
                    "error": error.to_string(),
                    "failure_kind": kind,
                    "node_id": execution.failed_node_id,
                }),
            ),
        )
        .await;
        Ok(())
    }

    /// Execution plus node history, for `get_status`.
    pub async fn report(&self, id: &ExecutionId) -> Result<ExecutionReport> {
        let execution = self.store.get_execution(id).await?;
        let nodes = self.store.list_node_executions(id).await?;
        Ok(ExecutionReport { execution, nodes })
    }

    /// Send an audit event. Errors are logged, never propagated.
    pub async fn audit(&self, event: AuditEvent) {
        if let Some(sink) = &self.audit {
            let action = event.action.clone();
            if let Err(e) = sink.record(event).await {
                warn!(action = %action, error = %e, "Audit sink failed, continuing");
            }
        }
    }
}

fn close_attempt(
    record: &mut NodeExecution,
    status: NodeStatus,
    error_message: Option<String>,
    duration_ms: u64,
) {
    let now = Utc::now();
    record.status = status;
    record.error_message = error_message.clone();
    record.completed_at = Some(now);
    record.duration_ms = Some(duration_ms);
    if let Some(attempt) = record.attempts.last_mut() {
        attempt.status = status;
        attempt.error_message = error_message;
        attempt.completed_at = Some(now);
        attempt.duration_ms = Some(duration_ms);
    }
}

fn elapsed_ms(execution: &FlowExecution) -> u64 {
    let since = execution.started_at.unwrap_or(execution.created_at);
    (Utc::now() - since).num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_store::MemoryStore;
    use agentflow_test_utils::{payload, FailingAuditSink, RecordingAuditSink};
    use serde_json::json;

    async fn setup() -> (ExecutionRecorder, Arc<MemoryStore>, FlowExecution) {
        let store = Arc::new(MemoryStore::new());
        let recorder = ExecutionRecorder::new(store.clone(), Arc::new(EventBus::default()));
        let execution =
            FlowExecution::new("flow", "acme", payload(json!({"x": 1})), serde_json::Value::Null);
        recorder.create(&execution).await.unwrap();
        (recorder, store, execution)
    }

    #[tokio::test]
    async fn mark_running_only_from_pending() {
        let (recorder, store, mut execution) = setup().await;
        recorder.mark_running(&mut execution).await.unwrap();
        assert_eq!(
            store.get_execution(&execution.id).await.unwrap().status,
            ExecutionStatus::Running
        );
        assert!(execution.started_at.is_some());

        let err = recorder.mark_running(&mut execution).await.unwrap_err();
        assert!(matches!(err, FlowError::InvalidState(_)));
    }

    #[tokio::test]
    async fn attempts_accumulate_on_one_row() {
        let (recorder, store, execution) = setup().await;
        let mut events = recorder.events().subscribe();
        let mut record = NodeExecution::new(execution.id.clone(), "A");

        recorder.attempt_started(&mut record, 0).await.unwrap();
        let err = FlowError::Execution("reset".into());
        recorder
            .attempt_failed(&mut record, &err, Duration::from_millis(5), false)
            .await
            .unwrap();
        recorder.attempt_started(&mut record, 1).await.unwrap();
        recorder
            .attempt_completed(&mut record, &json!({"ok": true}), Duration::from_millis(7))
            .await
            .unwrap();

        let rows = store.list_node_executions(&execution.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.status, NodeStatus::Completed);
        assert_eq!(row.retry_attempt, 1);
        assert_eq!(row.error_message, None);
        assert_eq!(row.duration_ms, Some(7));
        assert_eq!(row.attempts.len(), 2);
        assert_eq!(row.attempts[0].status, NodeStatus::Failed);
        assert!(row.attempts[0].error_message.as_deref().unwrap().contains("reset"));

        let mut failed_events = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, FlowEvent::NodeFailed { .. }) {
                failed_events += 1;
            }
        }
        assert_eq!(failed_events, 0);
    }

    #[tokio::test]
    async fn abort_touches_only_running_nodes() {
        let (recorder, _store, execution) = setup().await;
        let timeout = FlowError::Timeout { timeout_secs: 1 };

        let mut done = NodeExecution::new(execution.id.clone(), "A");
        recorder.attempt_started(&mut done, 0).await.unwrap();
        recorder
            .attempt_completed(&mut done, &json!({}), Duration::ZERO)
            .await
            .unwrap();
        recorder.abort_node(&mut done, &timeout).await.unwrap();
        assert_eq!(done.status, NodeStatus::Completed);

        let mut running = NodeExecution::new(execution.id.clone(), "B");
        recorder.attempt_started(&mut running, 0).await.unwrap();
        recorder.abort_node(&mut running, &timeout).await.unwrap();
        assert_eq!(running.status, NodeStatus::Failed);
        assert_eq!(running.attempts[0].status, NodeStatus::Failed);
        assert!(running.error_message.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn fail_records_kind_and_node() {
        let (recorder, store, mut execution) = setup().await;
        let audit = Arc::new(RecordingAuditSink::new());
        let recorder = recorder.with_audit(audit.clone());
        recorder.mark_running(&mut execution).await.unwrap();
        execution.execution_data.record("A", json!({"v": 1}));

        let err = FlowError::Validation("bad amount".into()).at_node(
            "B",
            Some("scorer".into()),
            Some("score".into()),
        );
        recorder.fail(&mut execution, &err).await.unwrap();

        let stored = store.get_execution(&execution.id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Failed);
        assert_eq!(stored.failure_kind, Some(FailureKind::Validation));
        assert_eq!(stored.failed_node_id.as_deref(), Some("B"));
        assert!(stored.execution_data.contains("A"));
        assert!(stored.completed_at.is_some());
        assert_eq!(
            audit.actions(),
            ["flow_execution_started", "flow_execution_failed"]
        );
        assert_eq!(audit.events()[1].detail["node_id"], json!("B"));
    }

    #[tokio::test]
    async fn timeout_blames_current_node() {
        let (recorder, _store, mut execution) = setup().await;
        recorder.mark_running(&mut execution).await.unwrap();
        execution.current_node_id = Some("wait".into());

        recorder
            .fail(&mut execution, &FlowError::Timeout { timeout_secs: 3 })
            .await
            .unwrap();
        assert_eq!(execution.failure_kind, Some(FailureKind::Timeout));
        assert_eq!(execution.failed_node_id.as_deref(), Some("wait"));
    }

    #[tokio::test]
    async fn audit_failure_is_swallowed() {
        let (recorder, _store, mut execution) = setup().await;
        let recorder = recorder.with_audit(Arc::new(FailingAuditSink));
        recorder.mark_running(&mut execution).await.unwrap();
        recorder.complete(&mut execution).await.unwrap();

        let report = recorder.report(&execution.id).await.unwrap();
        assert_eq!(report.execution.status, ExecutionStatus::Completed);
        assert!(report.execution.current_node_id.is_none());
        assert!(report.nodes.is_empty());
    }
}
