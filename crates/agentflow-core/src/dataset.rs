use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Accumulated node outputs of one execution, keyed by node id.
///
/// Entries are only ever added or replaced (a revisited node overwrites its
/// own entry); nothing is removed. Readers that must not observe sibling
/// writes take a `snapshot()` and resolve against that.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionData {
    data: BTreeMap<String, serde_json::Value>,
}

impl ExecutionData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: BTreeMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    /// Output of a node, if it has completed.
    pub fn get(&self, node_id: &str) -> Option<&serde_json::Value> {
        self.data.get(node_id)
    }

    /// A single field of a node's output object.
    pub fn field(&self, node_id: &str, field: &str) -> Option<&serde_json::Value> {
        self.data.get(node_id).and_then(|v| v.get(field))
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.data.contains_key(node_id)
    }

    /// Record a node's output.
    pub fn record(&mut self, node_id: impl Into<String>, output: serde_json::Value) {
        self.data.insert(node_id.into(), output);
    }

    /// Frozen copy for readers within one traversal pass.
    pub fn snapshot(&self) -> ExecutionData {
        self.clone()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the underlying data map.
    pub fn data(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.data
    }
}
