use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use agentflow_core::error::{FlowError, Result};
use agentflow_core::flow::FlowDefinition;
use agentflow_core::traits::FlowStore;
use agentflow_core::types::*;

#[derive(Default)]
struct State {
    /// Keyed by `(tenant_id, flow_id)`.
    flows: HashMap<(String, String), FlowDefinition>,
    executions: HashMap<ExecutionId, FlowExecution>,
    /// Execution ids in creation order.
    order: Vec<ExecutionId>,
    /// Node records per execution in first-dispatch order.
    nodes: HashMap<ExecutionId, Vec<NodeExecution>>,
}

/// Process-local `FlowStore`. Contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlowStore for MemoryStore {
    fn save_flow(&self, flow: &FlowDefinition) -> BoxFuture<'_, Result<()>> {
        let flow = flow.clone();
        Box::pin(async move {
            let key = (flow.tenant_id.clone(), flow.id.clone());
            self.state.write().await.flows.insert(key, flow);
            Ok(())
        })
    }

    fn load_flow(&self, flow_id: &str, tenant_id: &str) -> BoxFuture<'_, Result<FlowDefinition>> {
        let key = (tenant_id.to_string(), flow_id.to_string());
        Box::pin(async move {
            self.state
                .read()
                .await
                .flows
                .get(&key)
                .cloned()
                .ok_or_else(|| FlowError::FlowNotFound(format!("{} (tenant {})", key.1, key.0)))
        })
    }

    fn create_execution(&self, execution: &FlowExecution) -> BoxFuture<'_, Result<()>> {
        let execution = execution.clone();
        Box::pin(async move {
            let mut state = self.state.write().await;
            if state.executions.contains_key(&execution.id) {
                return Err(FlowError::Database(format!(
                    "execution {} already exists",
                    execution.id
                )));
            }
            state.order.push(execution.id.clone());
            state.executions.insert(execution.id.clone(), execution);
            Ok(())
        })
    }

    fn update_execution(&self, execution: &FlowExecution) -> BoxFuture<'_, Result<()>> {
        let execution = execution.clone();
        Box::pin(async move {
            let mut state = self.state.write().await;
            match state.executions.get_mut(&execution.id) {
                Some(slot) => {
                    *slot = execution;
                    Ok(())
                }
                None => Err(FlowError::ExecutionNotFound(execution.id.to_string())),
            }
        })
    }

    fn get_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<FlowExecution>> {
        let id = id.clone();
        Box::pin(async move {
            self.state
                .read()
                .await
                .executions
                .get(&id)
                .cloned()
                .ok_or_else(|| FlowError::ExecutionNotFound(id.to_string()))
        })
    }

    fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> BoxFuture<'_, Result<Vec<FlowExecution>>> {
        let filter = filter.clone();
        Box::pin(async move {
            let state = self.state.read().await;
            let matching = state
                .order
                .iter()
                .rev()
                .filter_map(|id| state.executions.get(id))
                .filter(|e| filter.matches(e))
                .cloned();
            Ok(match filter.limit {
                Some(limit) => matching.take(limit).collect(),
                None => matching.collect(),
            })
        })
    }

    fn upsert_node_execution(&self, node: &NodeExecution) -> BoxFuture<'_, Result<()>> {
        let node = node.clone();
        Box::pin(async move {
            let mut state = self.state.write().await;
            let records = state.nodes.entry(node.execution_id.clone()).or_default();
            match records.iter_mut().find(|r| r.node_id == node.node_id) {
                Some(existing) => *existing = node,
                None => records.push(node),
            }
            Ok(())
        })
    }

    fn list_node_executions(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Vec<NodeExecution>>> {
        let id = id.clone();
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .nodes
                .get(&id)
                .cloned()
                .unwrap_or_default())
        })
    }
}
