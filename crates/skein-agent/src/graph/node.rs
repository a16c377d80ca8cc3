use std::sync::Arc;

use futures::future::BoxFuture;

use skein_core::config::ModelConfig;
use skein_core::error::{Result, SkeinError};
use skein_core::prompt::{render, PromptTemplate};
use skein_core::traits::{LlmClient, StepAgent};
use skein_core::types::ChatMessage;

use super::value::{Value, ValueKind};
use crate::aggregate::aggregate;

/// Role a node plays in a graph.
///
/// `start` and `end` are virtual ids and branching is a successor rule, so
/// neither needs a kind of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    TemplateRender,
    GenerativeCall,
    Transform,
}

/// Work performed when a node runs.
pub trait NodeBehavior: Send + Sync + 'static {
    fn run(&self, input: Value) -> BoxFuture<'_, Result<Value>>;
}

/// A node in a workflow graph.
///
/// Immutable once added. `label` keys this node's output in a fan-in mapping
/// and defaults to the id.
#[derive(Clone)]
pub struct Node {
    pub id: String,
    pub label: String,
    pub kind: NodeKind,
    pub input: ValueKind,
    pub output: ValueKind,
    behavior: Arc<dyn NodeBehavior>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("input", &self.input)
            .field("output", &self.output)
            .finish()
    }
}

impl Node {
    pub fn new(
        id: impl Into<String>,
        kind: NodeKind,
        input: ValueKind,
        output: ValueKind,
        behavior: impl NodeBehavior,
    ) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            kind,
            input,
            output,
            behavior: Arc::new(behavior),
        }
    }

    /// Render a system + user template into chat messages.
    pub fn template(id: impl Into<String>, input: ValueKind, template: PromptTemplate) -> Self {
        Self::new(
            id,
            NodeKind::TemplateRender,
            input,
            ValueKind::Messages,
            TemplateBehavior { template },
        )
    }

    /// Render a single text template, e.g. a notice built from a judgment.
    pub fn notice(id: impl Into<String>, input: ValueKind, template: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::TemplateRender,
            input,
            ValueKind::Text,
            NoticeBehavior {
                template: template.into(),
            },
        )
    }

    /// One model turn over the incoming messages.
    pub fn generate(id: impl Into<String>, llm: Arc<dyn LlmClient>, model: ModelConfig) -> Self {
        Self::new(
            id,
            NodeKind::GenerativeCall,
            ValueKind::Messages,
            ValueKind::Message,
            GenerateBehavior { llm, model },
        )
    }

    /// Run a step agent on the stringified input and aggregate its events.
    pub fn agent(id: impl Into<String>, agent: Arc<dyn StepAgent>, max_iterations: usize) -> Self {
        Self::new(
            id,
            NodeKind::GenerativeCall,
            ValueKind::Text,
            ValueKind::Message,
            AgentBehavior {
                agent,
                max_iterations,
            },
        )
    }

    /// A pure function from input to output.
    pub fn transform<F>(id: impl Into<String>, input: ValueKind, output: ValueKind, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self::new(id, NodeKind::Transform, input, output, TransformBehavior(f))
    }

    /// Fan-in node that folds its predecessor mapping into `{ "content": text }`.
    pub fn merge(id: impl Into<String>) -> Self {
        Self::transform(id, ValueKind::Merged, ValueKind::Vars, |input| match input {
            Value::Merged(entries) => Ok(Value::var("content", super::value::merge_text(&entries))),
            other => Err(SkeinError::ContractViolation {
                node: "merge".into(),
                expected: ValueKind::Merged.to_string(),
                found: other.kind().to_string(),
            }),
        })
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Override the input contract.
    pub fn accepting(mut self, input: ValueKind) -> Self {
        self.input = input;
        self
    }

    pub(crate) fn run(&self, input: Value) -> BoxFuture<'_, Result<Value>> {
        self.behavior.run(input)
    }
}

struct TemplateBehavior {
    template: PromptTemplate,
}

impl NodeBehavior for TemplateBehavior {
    fn run(&self, input: Value) -> BoxFuture<'_, Result<Value>> {
        let messages = self.template.format(&input.to_vars());
        Box::pin(async move { Ok(Value::Messages(messages)) })
    }
}

struct NoticeBehavior {
    template: String,
}

impl NodeBehavior for NoticeBehavior {
    fn run(&self, input: Value) -> BoxFuture<'_, Result<Value>> {
        let text = render(&self.template, &input.to_vars());
        Box::pin(async move { Ok(Value::Text(text)) })
    }
}

struct GenerateBehavior {
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
}

impl NodeBehavior for GenerateBehavior {
    fn run(&self, input: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let messages = match input {
                Value::Messages(msgs) => msgs,
                Value::Message(msg) => vec![msg],
                other => vec![ChatMessage::user(other.to_string())],
            };
            let reply = skein_llm::complete(self.llm.as_ref(), &self.model, messages).await?;
            Ok(Value::Message(reply))
        })
    }
}

struct AgentBehavior {
    agent: Arc<dyn StepAgent>,
    max_iterations: usize,
}

impl NodeBehavior for AgentBehavior {
    fn run(&self, input: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let events = self.agent.run(input.to_string(), self.max_iterations);
            let text = aggregate(events, None).await?;
            Ok(Value::Message(ChatMessage::assistant(text)))
        })
    }
}

struct TransformBehavior<F>(F);

impl<F> NodeBehavior for TransformBehavior<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
{
    fn run(&self, input: Value) -> BoxFuture<'_, Result<Value>> {
        let out = (self.0)(input);
        Box::pin(async move { out })
    }
}
