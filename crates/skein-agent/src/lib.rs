pub mod agent;
pub mod aggregate;
pub mod chain;
pub mod graph;
pub mod pipeline;
pub mod session;

pub use agent::LlmAgent;
pub use aggregate::aggregate;
pub use chain::SequentialChain;
pub use graph::{
    Branch, CompiledGraph, ExecutionResult, Graph, Node, NodeBehavior, NodeKind, NodeResult, Value,
    ValueKind, END, START,
};
pub use pipeline::{PipelinePrompts, TravelAgents, TravelPlanPipeline};
pub use session::{
    LlmSessionFactory, SessionFactory, SessionHandle, SessionInfo, SessionOptions, SessionRegistry,
};
