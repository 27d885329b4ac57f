//! Flow graph model: the compiled form of a `FlowDefinition`.
//!
//! A flow is a directed graph of `Node`s connected by `Edge`s. Nodes are
//! agent skill calls, conditions or delays; edges may be guarded by a
//! predicate over the accumulated execution data.
//!
//! `GraphModel::build` validates the structure and parses every template and
//! predicate once, so traversal never re-parses strings.

pub mod edge;
pub mod model;
pub mod node;

pub use edge::Edge;
pub use model::GraphModel;
pub use node::{AgentCall, AgentTarget, Node, NodeKind};
