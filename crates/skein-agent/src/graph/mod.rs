//! Workflow graph engine.
//!
//! A workflow is a DAG of typed [`Node`]s between the virtual `start` and
//! `end` nodes. Edges pass a node's output unchanged to every successor; a
//! [`Branch`] instead picks exactly one successor at run time. A node whose
//! input contract is [`ValueKind::Merged`] is a fan-in point and receives its
//! predecessors' outputs keyed by their labels.
//!
//! A [`Graph`] is validated once by [`Graph::compile`] and the resulting
//! [`CompiledGraph`] is invoked as many times as needed.

pub mod builder;
pub mod edge;
pub mod executor;
pub mod node;
pub mod value;

pub use builder::{Graph, END, START};
pub use edge::Branch;
pub use executor::{CompiledGraph, ExecutionResult, NodeResult};
pub use node::{Node, NodeBehavior, NodeKind};
pub use value::{merge_text, Value, ValueKind};
