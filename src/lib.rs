//! Agent flow execution engine.
//!
//! Runs tenant-scoped directed graphs of agent skill calls, conditions and
//! delays, with per-node retry, a flow-level timeout and durable execution
//! records. This crate re-exports the workspace crates and wires them from
//! an `AppConfig`.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

pub use agentflow_core::config::{AppConfig, EngineConfig, LogConfig, StoreBackend, StoreConfig};
pub use agentflow_core::error::{FlowError, Result};
pub use agentflow_core::event::EventBus;
pub use agentflow_core::flow::*;
pub use agentflow_core::traits::{AuditSink, FlowStore, RuleEvaluator, SkillExecutor};
pub use agentflow_core::types::*;
pub use agentflow_core::ExecutionData;
pub use agentflow_engine::{
    ExecutionRecorder, FlowEngine, FlowService, GraphModel, RunLogger, RunMode, TemplateResolver,
};
pub use agentflow_store::{open_store, MemoryStore, SqliteStore};

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins over `config.filter`. Calling this more than once is a
/// no-op.
pub fn init_tracing(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Open the configured store and build a `FlowService` around it.
pub fn build_service(
    config: &AppConfig,
    skills: Arc<dyn SkillExecutor>,
    rules: Option<Arc<dyn RuleEvaluator>>,
    audit: Option<Arc<dyn AuditSink>>,
) -> Result<FlowService> {
    let store = open_store(&config.store)?;
    let service = FlowService::from_config(config, store, skills, rules, audit);
    info!(
        backend = ?config.store.backend,
        run_logs = config.log.enabled,
        mode = ?service.mode(),
        "Flow service ready"
    );
    Ok(service)
}
