pub mod providers;
pub mod retry;
pub mod streaming;

use futures::StreamExt;
use tracing::debug;

use skein_core::config::{AppConfig, ModelConfig, RetryConfig};
use skein_core::error::Result;
use skein_core::traits::LlmClient;
use skein_core::types::{ChatMessage, StopReason, StreamDelta};

pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create an LLM client for a model configuration.
///
/// Every provider speaks the OpenAI chat-completions protocol. When the
/// config carries a `[retry]` table the client is wrapped in a [`RetryingClient`].
pub fn create_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    with_retry(Box::new(OpenAiClient::new()), config.retry.as_ref())
}

fn with_retry(base: Box<dyn LlmClient>, retry: Option<&RetryConfig>) -> Box<dyn LlmClient> {
    match retry {
        Some(retry) => Box::new(RetryingClient::new(base, retry.clone())),
        None => base,
    }
}

/// Create the default model's client, with `fallback_models` attached.
pub fn create_app_client(config: &AppConfig) -> Box<dyn LlmClient> {
    if config.fallback_models.is_empty() {
        return create_client(&config.model);
    }
    let mut client = RetryingClient::new(
        Box::new(OpenAiClient::new()),
        config.model.retry.clone().unwrap_or_default(),
    );
    for fb in &config.fallback_models {
        client = client.with_fallback(fb.clone(), create_client(fb));
    }
    Box::new(client)
}

/// Result of draining one model turn.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub stop_reason: Option<StopReason>,
}

/// Drain a chat stream, calling `on_chunk` for every non-empty text delta.
pub async fn complete_with(
    llm: &dyn LlmClient,
    config: &ModelConfig,
    messages: Vec<ChatMessage>,
    mut on_chunk: Option<&mut (dyn FnMut(&str) + Send)>,
) -> Result<Completion> {
    let mut stream = llm.chat_stream(config, messages).await?;
    let mut text = String::new();
    let mut stop_reason = None;

    while let Some(delta) = stream.next().await {
        match delta? {
            StreamDelta::TextDelta(chunk) => {
                if chunk.is_empty() {
                    continue;
                }
                if let Some(cb) = on_chunk.as_deref_mut() {
                    cb(&chunk);
                }
                text.push_str(&chunk);
            }
            StreamDelta::Stop(reason) => stop_reason = Some(reason),
            StreamDelta::Usage {
                input_tokens,
                output_tokens,
            } => debug!(model = %config.model_id, input_tokens, output_tokens, "Token usage"),
        }
    }

    Ok(Completion { text, stop_reason })
}

/// Non-streaming completion: the whole reply as one assistant message.
pub async fn complete(
    llm: &dyn LlmClient,
    config: &ModelConfig,
    messages: Vec<ChatMessage>,
) -> Result<ChatMessage> {
    let completion = complete_with(llm, config, messages, None).await?;
    Ok(ChatMessage::assistant(completion.text))
}

/// Streaming completion: `on_chunk` sees each non-empty chunk in order and
/// the full concatenation is returned. A reply with no text yields `""`.
pub async fn complete_streaming(
    llm: &dyn LlmClient,
    config: &ModelConfig,
    messages: Vec<ChatMessage>,
    on_chunk: &mut (dyn FnMut(&str) + Send),
) -> Result<String> {
    let completion = complete_with(llm, config, messages, Some(on_chunk)).await?;
    Ok(completion.text)
}
