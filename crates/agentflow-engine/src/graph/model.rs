use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use agentflow_core::error::{FlowError, Result};
use agentflow_core::flow::FlowDefinition;

use super::edge::Edge;
use super::node::Node;

/// A validated, compiled flow graph. Read-only during traversal.
#[derive(Debug, Clone)]
pub struct GraphModel {
    flow_id: String,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    /// Edge indices by source node id.
    outgoing: HashMap<String, Vec<usize>>,
    start: Vec<String>,
    /// Transitive successors of each node.
    descendants: HashMap<String, HashSet<String>>,
    timeout: Option<Duration>,
    retry_on_failure: Option<bool>,
    retry_count: Option<u32>,
}

impl GraphModel {
    /// Compile and validate a flow definition.
    ///
    /// Fails with `FlowError::Structural` when the flow has no nodes, repeats
    /// a node id, has an edge to or from an unknown node, contains a
    /// malformed template, or has no node without incoming edges.
    pub fn build(flow: &FlowDefinition) -> Result<Self> {
        if flow.nodes.is_empty() {
            return Err(FlowError::Structural(format!(
                "flow '{}' has no nodes",
                flow.id
            )));
        }

        let mut nodes = Vec::with_capacity(flow.nodes.len());
        let mut index = HashMap::new();
        for spec in &flow.nodes {
            let node = Node::compile(spec)?;
            if index.insert(node.id.clone(), nodes.len()).is_some() {
                return Err(FlowError::Structural(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
            nodes.push(node);
        }

        let mut edges = Vec::with_capacity(flow.edges.len());
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut has_incoming = HashSet::new();
        for spec in &flow.edges {
            for end in [&spec.from, &spec.to] {
                if !index.contains_key(end) {
                    return Err(FlowError::Structural(format!(
                        "edge {} -> {} references unknown node '{}'",
                        spec.from, spec.to, end
                    )));
                }
            }
            let edge = Edge::compile(spec)?;
            outgoing.entry(edge.from.clone()).or_default().push(edges.len());
            has_incoming.insert(edge.to.clone());
            edges.push(edge);
        }

        let start: Vec<String> = nodes
            .iter()
            .filter(|n| !has_incoming.contains(&n.id))
            .map(|n| n.id.clone())
            .collect();
        if start.is_empty() {
            return Err(FlowError::Structural(format!(
                "flow '{}' has no entry node (every node has an incoming edge)",
                flow.id
            )));
        }

        let mut model = Self {
            flow_id: flow.id.clone(),
            nodes,
            index,
            edges,
            outgoing,
            start,
            descendants: HashMap::new(),
            timeout: flow
                .timeout_seconds
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            retry_on_failure: flow.retry_on_failure,
            retry_count: flow.retry_count,
        };
        model.descendants = model.compute_descendants();
        Ok(model)
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// Entry points in declaration order.
    pub fn start_nodes(&self) -> &[String] {
        &self.start
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Edges leaving `node_id`, in declaration order.
    pub fn outgoing(&self, node_id: &str) -> Vec<&Edge> {
        self.outgoing
            .get(node_id)
            .map(|ids| ids.iter().map(|&i| &self.edges[i]).collect())
            .unwrap_or_default()
    }

    /// Whether a path of one or more edges leads from `from` to `to`.
    pub fn reaches(&self, from: &str, to: &str) -> bool {
        self.descendants
            .get(from)
            .is_some_and(|set| set.contains(to))
    }

    pub fn has_cycle(&self) -> bool {
        self.nodes.iter().any(|n| self.reaches(&n.id, &n.id))
    }

    /// Reject graphs containing a cycle.
    pub fn ensure_acyclic(&self) -> Result<()> {
        match self.nodes.iter().find(|n| self.reaches(&n.id, &n.id)) {
            Some(node) => Err(FlowError::Structural(format!(
                "flow '{}' contains a cycle through node '{}'",
                self.flow_id, node.id
            ))),
            None => Ok(()),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn retry_on_failure(&self) -> Option<bool> {
        self.retry_on_failure
    }

    pub fn retry_count(&self) -> Option<u32> {
        self.retry_count
    }

    fn compute_descendants(&self) -> HashMap<String, HashSet<String>> {
        let mut result = HashMap::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let mut seen = HashSet::new();
            let mut queue: VecDeque<&str> = VecDeque::from([node.id.as_str()]);
            while let Some(current) = queue.pop_front() {
                for edge in self.outgoing(current) {
                    if seen.insert(edge.to.clone()) {
                        queue.push_back(edge.to.as_str());
                    }
                }
            }
            result.insert(node.id.clone(), seen);
        }
        result
    }
}
