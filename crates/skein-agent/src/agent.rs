use std::sync::Arc;

use futures::stream::{self, BoxStream};
use tracing::{debug, info, warn};

use skein_core::config::ModelConfig;
use skein_core::traits::{LlmClient, StepAgent};
use skein_core::types::{ChatMessage, StepEvent, StopReason};

/// Prompt appended when a reply was cut off by the token limit.
const CONTINUE_PROMPT: &str = "Continue exactly where you stopped.";

/// A step agent backed by a chat model.
///
/// Each turn streams one assistant reply and emits it as a [`StepEvent`].
/// The run ends when the model stops on its own; a reply truncated by the
/// token limit is continued on the next turn, up to `max_iterations` turns.
/// Every event carries the text accumulated so far, so the last event is
/// the complete answer.
pub struct LlmAgent {
    name: String,
    instruction: String,
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
}

impl LlmAgent {
    pub fn new(
        name: impl Into<String>,
        instruction: impl Into<String>,
        llm: Arc<dyn LlmClient>,
        model: ModelConfig,
    ) -> Self {
        Self {
            name: name.into(),
            instruction: instruction.into(),
            llm,
            model,
        }
    }
}

struct TurnState {
    messages: Vec<ChatMessage>,
    text: String,
    turn: usize,
    done: bool,
}

impl StepAgent for LlmAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, input: String, max_iterations: usize) -> BoxStream<'_, StepEvent> {
        let state = TurnState {
            messages: vec![
                ChatMessage::system(self.instruction.clone()),
                ChatMessage::user(input),
            ],
            text: String::new(),
            turn: 0,
            done: false,
        };

        Box::pin(stream::unfold(state, move |mut st| async move {
            if st.done || st.turn >= max_iterations {
                return None;
            }
            st.turn += 1;
            debug!(agent = %self.name, turn = st.turn, "Starting agent turn");

            let reply =
                skein_llm::complete_with(self.llm.as_ref(), &self.model, st.messages.clone(), None)
                    .await;
            let completion = match reply {
                Ok(c) => c,
                Err(e) => {
                    warn!(agent = %self.name, turn = st.turn, error = %e, "Agent turn failed");
                    st.done = true;
                    return Some((StepEvent::error(self.name.clone(), e), st));
                }
            };

            st.text.push_str(&completion.text);
            if completion.stop_reason == Some(StopReason::MaxTokens) {
                warn!(agent = %self.name, turn = st.turn, "Reply hit max tokens, continuing");
                st.messages.push(ChatMessage::assistant(completion.text));
                st.messages.push(ChatMessage::user(CONTINUE_PROMPT));
            } else {
                info!(agent = %self.name, turns = st.turn, "Agent run complete");
                st.done = true;
            }

            let event = StepEvent::message(self.name.clone(), ChatMessage::assistant(st.text.clone()));
            Some((event, st))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::aggregate;
    use futures::StreamExt;
    use skein_core::error::SkeinError;
    use skein_core::types::Role;
    use skein_test_utils::{test_model_config, MockLlm};

    #[tokio::test]
    async fn test_single_turn() {
        let llm = MockLlm::new().with_text("Take the night train.");
        let requests = llm.requests_handle();
        let agent = LlmAgent::new("FlightAdvisor", "You advise on flights.", Arc::new(llm), test_model_config());

        let out = aggregate(agent.run("Paris to Rome".into(), 50), None)
            .await
            .unwrap();
        assert_eq!(out, "Take the night train.");

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0][0].role, Role::System);
        assert_eq!(requests[0][0].content, "You advise on flights.");
        assert_eq!(requests[0][1].content, "Paris to Rome");
    }

    #[tokio::test]
    async fn test_truncated_reply_is_continued() {
        let llm = MockLlm::new().with_truncated("Day 1: Uffizi. ").with_text("Day 2: Pisa.");
        let agent = LlmAgent::new("Daily", "Plan days.", Arc::new(llm), test_model_config());
        let out = aggregate(agent.run("Florence".into(), 5), None).await.unwrap();
        assert_eq!(out, "Day 1: Uffizi. Day 2: Pisa.");
    }

    #[tokio::test]
    async fn test_iteration_ceiling_is_respected() {
        let llm = MockLlm::new()
            .with_truncated("a")
            .with_truncated("b")
            .with_truncated("c");
        let calls = llm.call_count_handle();
        let agent = LlmAgent::new("Looper", "", Arc::new(llm), test_model_config());

        let events: Vec<StepEvent> = agent.run("go".into(), 2).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(events[1].content(), Some("ab"));
    }

    #[tokio::test]
    async fn test_llm_error_becomes_error_event() {
        let llm = MockLlm::new().with_failure(SkeinError::LlmRequest("HTTP 503".into()));
        let agent = LlmAgent::new("Broken", "", Arc::new(llm), test_model_config());
        let err = aggregate(agent.run("x".into(), 3), None).await.unwrap_err();
        assert!(matches!(err, SkeinError::LlmRequest(_)));
    }
}
