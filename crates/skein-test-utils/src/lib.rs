//! Test doubles shared by the skein crates.
//!
//! Everything here is deterministic and in-process: no network, no model.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};

use skein_core::config::ModelConfig;
use skein_core::error::{Result, SkeinError};
use skein_core::traits::{EmbeddingProvider, LlmClient, StepAgent};
use skein_core::types::*;

/// A model config that points nowhere. Mocks ignore it.
pub fn test_model_config() -> ModelConfig {
    ModelConfig {
        provider: "mock".into(),
        model_id: "mock-model".into(),
        api_key: None,
        base_url: None,
        max_tokens: 256,
        temperature: 0.0,
        timeout_secs: 5,
        retry: None,
    }
}

enum Reply {
    Chunks(Vec<String>, StopReason),
    Fail(SkeinError),
}

type Responder = dyn Fn(&[ChatMessage]) -> Result<String> + Send + Sync;

/// Scripted LLM.
///
/// Queued replies are served in order. Once the queue is empty the responder
/// (if any) answers; otherwise the call fails.
pub struct MockLlm {
    script: Mutex<VecDeque<Reply>>,
    responder: Option<Arc<Responder>>,
    calls: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            responder: None,
            calls: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_text(self, text: &str) -> Self {
        self.with_chunks(vec![text])
    }

    pub fn with_chunks(self, chunks: Vec<&str>) -> Self {
        self.push(Reply::Chunks(
            chunks.into_iter().map(String::from).collect(),
            StopReason::EndTurn,
        ))
    }

    /// A reply cut off by the token limit.
    pub fn with_truncated(self, text: &str) -> Self {
        self.push(Reply::Chunks(vec![text.to_string()], StopReason::MaxTokens))
    }

    pub fn with_failure(self, error: SkeinError) -> Self {
        self.push(Reply::Fail(error))
    }

    pub fn with_responder(
        mut self,
        f: impl Fn(&[ChatMessage]) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Arc::new(f));
        self
    }

    pub fn call_count_handle(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Every message list this mock has been called with.
    pub fn requests_handle(&self) -> Arc<Mutex<Vec<Vec<ChatMessage>>>> {
        self.requests.clone()
    }

    fn push(self, reply: Reply) -> Self {
        self.script.lock().unwrap().push_back(reply);
        self
    }
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmClient for MockLlm {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(messages.clone());
        let next = self.script.lock().unwrap().pop_front();

        let reply = match next {
            Some(reply) => reply,
            None => match &self.responder {
                Some(f) => match f(&messages) {
                    Ok(text) => Reply::Chunks(vec![text], StopReason::EndTurn),
                    Err(e) => Reply::Fail(e),
                },
                None => Reply::Fail(SkeinError::LlmRequest("mock script exhausted".into())),
            },
        };

        Box::pin(async move {
            match reply {
                Reply::Fail(e) => Err(e),
                Reply::Chunks(chunks, stop) => {
                    let mut deltas: Vec<Result<StreamDelta>> = chunks
                        .into_iter()
                        .map(|c| Ok(StreamDelta::TextDelta(c)))
                        .collect();
                    deltas.push(Ok(StreamDelta::Stop(stop)));
                    Ok(Box::pin(stream::iter(deltas)) as BoxStream<'_, Result<StreamDelta>>)
                }
            }
        })
    }
}

/// What a [`MockAgent`] emits for one run.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// An assistant message with this content.
    Say(String),
    /// An error event with this message.
    Fail(String),
}

/// Step agent that replays a fixed event list.
///
/// A `Say` of `"{input}"` echoes the run's input; other text containing
/// `{input}` has it substituted.
pub struct MockAgent {
    name: String,
    steps: Vec<MockStep>,
    inputs: Arc<Mutex<Vec<String>>>,
}

impl MockAgent {
    pub fn new(name: &str, steps: Vec<MockStep>) -> Self {
        Self {
            name: name.to_string(),
            steps,
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Agent that answers with one message.
    pub fn saying(name: &str, text: &str) -> Self {
        Self::new(name, vec![MockStep::Say(text.to_string())])
    }

    pub fn inputs_handle(&self) -> Arc<Mutex<Vec<String>>> {
        self.inputs.clone()
    }
}

impl StepAgent for MockAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, input: String, _max_iterations: usize) -> BoxStream<'_, StepEvent> {
        self.inputs.lock().unwrap().push(input.clone());
        let events: Vec<StepEvent> = self
            .steps
            .iter()
            .map(|step| match step {
                MockStep::Say(text) => StepEvent::message(
                    self.name.clone(),
                    ChatMessage::assistant(text.replace("{input}", &input)),
                ),
                MockStep::Fail(msg) => StepEvent::error(
                    self.name.clone(),
                    SkeinError::Agent {
                        agent: self.name.clone(),
                        message: msg.clone(),
                    },
                ),
            })
            .collect();
        Box::pin(stream::iter(events))
    }
}

/// Deterministic embedder.
///
/// Texts registered with [`MockEmbedder::with_vector`] map to that vector;
/// anything else gets a small letter-frequency vector.
pub struct MockEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    fail: bool,
    empty: bool,
    calls: Arc<AtomicUsize>,
}

pub const MOCK_EMBEDDING_DIM: usize = 8;

impl MockEmbedder {
    pub fn new() -> Self {
        Self {
            vectors: HashMap::new(),
            fail: false,
            empty: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_vector(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }

    /// Every call fails as if the service were down.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    /// Every call succeeds with an empty vector.
    pub fn returning_empty() -> Self {
        Self {
            empty: true,
            ..Self::new()
        }
    }

    pub fn call_count_handle(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

fn letter_histogram(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; MOCK_EMBEDDING_DIM];
    for b in text.bytes().filter(u8::is_ascii_alphabetic) {
        v[(b.to_ascii_lowercase() - b'a') as usize % MOCK_EMBEDDING_DIM] += 1.0;
    }
    if v.iter().all(|x| *x == 0.0) {
        v[0] = 1.0;
    }
    v
}

impl EmbeddingProvider for MockEmbedder {
    fn embed(&self, text: &str) -> BoxFuture<'_, Result<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail {
            Err(SkeinError::EmbeddingUnavailable("mock embedder is down".into()))
        } else if self.empty {
            Ok(Vec::new())
        } else {
            Ok(self
                .vectors
                .get(text)
                .cloned()
                .unwrap_or_else(|| letter_histogram(text)))
        };
        Box::pin(async move { result })
    }

    fn model(&self) -> &str {
        "mock-embedder"
    }
}

/// Write a prompt directory with the four pipeline prompt files.
pub fn write_prompt_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let files = [
        (
            "red_flag_system.txt",
            "Judge whether the trip request is feasible. Reply as JSON with red_flag, description, address.",
        ),
        (
            "red_flag_notice.txt",
            "The plan is blocked: {description}. Suggested alternative: {address}.",
        ),
        ("no_red_flag_notice.txt", "The plan is feasible. Start planning."),
        ("summary_prompt.txt", "Summarize the travel plan below."),
    ];
    for (name, body) in files {
        std::fs::write(dir.path().join(name), body).unwrap();
    }
    dir
}

/// Serialize a judgment the way a classifier model would reply.
pub fn judgment_reply(red_flag: bool, description: &str, address: &str) -> String {
    serde_json::json!({
        "red_flag": red_flag,
        "description": description,
        "address": address,
    })
    .to_string()
}
