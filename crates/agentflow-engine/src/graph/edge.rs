use agentflow_core::error::Result;
use agentflow_core::flow::EdgeSpec;
use agentflow_core::types::Payload;
use agentflow_core::ExecutionData;

use crate::condition::{Condition, ConditionEvaluator};

/// An edge connecting two nodes in the execution graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Guard; `None` means the edge is always taken.
    pub condition: Option<Condition>,
}

impl Edge {
    pub fn compile(spec: &EdgeSpec) -> Result<Self> {
        Ok(Self {
            from: spec.from.clone(),
            to: spec.to.clone(),
            condition: spec.condition.as_ref().map(Condition::compile).transpose()?,
        })
    }

    /// Whether traversal may follow this edge given the current data.
    pub fn is_satisfied(&self, data: &ExecutionData, trigger: &Payload) -> bool {
        match &self.condition {
            None => true,
            Some(condition) => ConditionEvaluator::evaluate(condition, data, trigger),
        }
    }
}
