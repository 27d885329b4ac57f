pub mod condition;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod recorder;
pub mod run_log;
pub mod service;
pub mod template;

pub use condition::{Condition, ConditionEvaluator};
pub use engine::FlowEngine;
pub use executor::{backoff_delay, NodeExecutor, RetryPolicy};
pub use graph::{Edge, GraphModel, Node, NodeKind};
pub use recorder::ExecutionRecorder;
pub use run_log::RunLogger;
pub use service::{FlowService, RunMode};
pub use template::{InputTemplate, Reference, TemplateResolver};
