use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// LLM client: streaming chat completion.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// Step agent: a bounded, self-terminating sub-run.
///
/// The agent decides internally when to stop, but never runs more than
/// `max_iterations` turns. The returned stream is finite and not restartable.
pub trait StepAgent: Send + Sync + 'static {
    /// Agent name, stamped on every emitted event.
    fn name(&self) -> &str;

    /// Run the agent on `input`.
    fn run(&self, input: String, max_iterations: usize) -> BoxStream<'_, StepEvent>;
}

/// Embedding provider: text to vector.
pub trait EmbeddingProvider: Send + Sync + 'static {
    /// Embed a single text.
    fn embed(&self, text: &str) -> BoxFuture<'_, Result<Vec<f32>>>;

    /// Model name, for logging.
    fn model(&self) -> &str;
}

/// A raw row returned by a similarity-search backend.
///
/// Fields are optional because backends may hand back partially decodable
/// records; callers skip the ones they cannot use.
#[derive(Debug, Clone, Default)]
pub struct RawHit {
    pub key: String,
    pub content: Option<String>,
    pub score: Option<f64>,
}

/// Similarity-search backend: keyed vector storage with k-NN lookup.
pub trait VectorIndex: Send + Sync + 'static {
    /// Persist one record under a unique key. Must fail on key collision.
    fn put(
        &self,
        index: &str,
        key: &str,
        content: &str,
        embedding: &[u8],
    ) -> BoxFuture<'_, Result<()>>;

    /// Return up to `k` rows ordered by ascending distance to `query`.
    fn search(&self, index: &str, query: &[f32], k: usize) -> BoxFuture<'_, Result<Vec<RawHit>>>;

    /// Number of records stored under `index`.
    fn count(&self, index: &str) -> BoxFuture<'_, Result<usize>>;
}
