use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use agentflow_core::config::AppConfig;
use agentflow_core::error::{FlowError, Result};
use agentflow_core::event::EventBus;
use agentflow_core::flow::{FlowDefinition, FlowStatus};
use agentflow_core::traits::{AuditSink, FlowStore, RuleEvaluator, SkillExecutor};
use agentflow_core::types::*;

use crate::engine::FlowEngine;
use crate::graph::GraphModel;
use crate::recorder::ExecutionRecorder;
use crate::run_log::RunLogger;

/// How `start` and `retry` drive the new execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Await the execution before returning its id.
    #[default]
    Synchronous,
    /// Spawn the execution and return its id at once; poll `get_status`.
    Background,
}

/// Entry point for callers: start, inspect and retry flow executions.
pub struct FlowService {
    engine: Arc<FlowEngine>,
    store: Arc<dyn FlowStore>,
    events: Arc<EventBus>,
    mode: RunMode,
    run_log_dir: Option<PathBuf>,
}

impl FlowService {
    pub fn new(engine: FlowEngine) -> Self {
        let store = engine.recorder().store().clone();
        let events = engine.recorder().events().clone();
        Self {
            engine: Arc::new(engine),
            store,
            events,
            mode: RunMode::default(),
            run_log_dir: None,
        }
    }

    /// Assemble a service from loaded configuration and its collaborators.
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn FlowStore>,
        skills: Arc<dyn SkillExecutor>,
        rules: Option<Arc<dyn RuleEvaluator>>,
        audit: Option<Arc<dyn AuditSink>>,
    ) -> Self {
        let mut recorder = ExecutionRecorder::new(store, Arc::new(EventBus::default()));
        if let Some(audit) = audit {
            recorder = recorder.with_audit(audit);
        }
        let mut engine = FlowEngine::new(config.engine.clone(), skills, recorder);
        if let Some(rules) = rules {
            engine = engine.with_rules(rules);
        }

        let service = Self::new(engine);
        if config.log.enabled {
            service.with_run_logs(config.log.resolved_log_dir())
        } else {
            service
        }
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Write a JSONL log per execution under `dir`.
    pub fn with_run_logs(mut self, dir: PathBuf) -> Self {
        self.run_log_dir = Some(dir);
        self
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn engine(&self) -> &FlowEngine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    /// Validate and store a flow definition.
    pub async fn register_flow(&self, flow: &FlowDefinition) -> Result<()> {
        self.engine.prepare(flow)?;
        self.store.save_flow(flow).await?;
        info!(flow_id = %flow.id, tenant_id = %flow.tenant_id, status = flow.status.as_str(), "Flow registered");
        Ok(())
    }

    /// Start a new execution of an active flow.
    ///
    /// The graph is validated before anything is persisted, so a malformed
    /// flow yields `FlowError::Structural` and no execution record.
    pub async fn start(
        &self,
        flow_id: &str,
        tenant_id: &str,
        trigger_data: Payload,
        context: Option<Value>,
    ) -> Result<ExecutionId> {
        let graph = self.load_graph(flow_id, tenant_id).await?;
        let execution = FlowExecution::new(
            flow_id,
            tenant_id,
            trigger_data,
            context.unwrap_or(Value::Null),
        );
        self.launch(graph, execution).await
    }

    /// Current state of an execution with its node history.
    pub async fn get_status(&self, execution_id: &ExecutionId) -> Result<ExecutionReport> {
        self.engine.recorder().report(execution_id).await
    }

    /// Re-run a failed execution as a fresh one with the same trigger data.
    ///
    /// The original record is never modified.
    pub async fn retry(&self, execution_id: &ExecutionId) -> Result<ExecutionId> {
        let original = self.store.get_execution(execution_id).await?;
        if original.status != ExecutionStatus::Failed {
            return Err(FlowError::InvalidState(format!(
                "execution {} is {}, only failed executions can be retried",
                original.id, original.status
            )));
        }

        let graph = self
            .load_graph(&original.flow_id, &original.tenant_id)
            .await?;
        let mut execution = FlowExecution::new(
            &original.flow_id,
            &original.tenant_id,
            original.trigger_data.clone(),
            original.context.clone(),
        );
        execution.retry_of = Some(original.id.clone());

        info!(
            execution_id = %execution.id,
            retry_of = %original.id,
            flow_id = %original.flow_id,
            "Retrying failed execution"
        );
        self.engine
            .recorder()
            .audit(
                AuditEvent::for_execution("flow_execution_retried", &execution)
                    .with_detail(json!({ "retry_of": original.id })),
            )
            .await;

        self.launch(graph, execution).await
    }

    pub async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<FlowExecution>> {
        self.store.list_executions(filter).await
    }

    async fn load_graph(&self, flow_id: &str, tenant_id: &str) -> Result<GraphModel> {
        let flow = self.store.load_flow(flow_id, tenant_id).await?;
        if flow.status != FlowStatus::Active {
            return Err(FlowError::InvalidState(format!(
                "flow '{}' is {}, only active flows can be executed",
                flow.id,
                flow.status.as_str()
            )));
        }
        self.engine.prepare(&flow)
    }

    async fn launch(&self, graph: GraphModel, execution: FlowExecution) -> Result<ExecutionId> {
        self.store.create_execution(&execution).await?;
        let id = execution.id.clone();
        let log = self.start_run_log(&id);

        match self.mode {
            RunMode::Synchronous => {
                let result = self.engine.run(&graph, execution).await;
                finish_run_log(log, result.is_ok()).await;
                result?;
            }
            RunMode::Background => {
                let engine = self.engine.clone();
                tokio::spawn(async move {
                    let result = engine.run(&graph, execution).await;
                    if let Err(e) = &result {
                        error!(error = %e, "Background execution could not be recorded");
                    }
                    finish_run_log(log, result.is_ok()).await;
                });
            }
        }

        Ok(id)
    }

    fn start_run_log(&self, id: &ExecutionId) -> Option<(CancellationToken, JoinHandle<()>)> {
        let dir = self.run_log_dir.clone()?;
        let cancel = CancellationToken::new();
        let handle = RunLogger::new(dir).spawn(&self.events, id.clone(), cancel.clone());
        Some((cancel, handle))
    }
}

/// A finished run has published its terminal event; otherwise stop the logger.
async fn finish_run_log(log: Option<(CancellationToken, JoinHandle<()>)>, published: bool) {
    if let Some((cancel, handle)) = log {
        if !published {
            cancel.cancel();
        }
        handle.await.ok();
    }
}
