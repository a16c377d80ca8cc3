use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tracing::{info, warn};

use skein_core::error::{Result, SkeinError};
use skein_core::traits::StepAgent;
use skein_core::types::StepEvent;

use crate::aggregate::aggregate;

/// Runs step agents in order, each one's final output feeding the next.
///
/// Events from every step are forwarded as they arrive. The first error
/// ends the chain with [`SkeinError::ChainStepFailed`]; later steps never run.
pub struct SequentialChain {
    name: String,
    steps: Vec<Arc<dyn StepAgent>>,
}

impl SequentialChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: Arc<dyn StepAgent>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run the chain to completion and return the last step's output.
    pub async fn invoke(&self, input: &str, max_iterations: usize) -> Result<String> {
        aggregate(self.run(input.to_string(), max_iterations), None).await
    }
}

struct ChainState<'a> {
    index: usize,
    input: String,
    current: Option<BoxStream<'a, StepEvent>>,
    last: Option<String>,
    done: bool,
}

impl StepAgent for SequentialChain {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, input: String, max_iterations: usize) -> BoxStream<'_, StepEvent> {
        if self.steps.is_empty() {
            warn!(chain = %self.name, "Agent chain has no steps");
            return Box::pin(stream::iter(vec![StepEvent::error(
                self.name.clone(),
                SkeinError::ChainEmpty,
            )]));
        }

        let state = ChainState {
            index: 0,
            input,
            current: None,
            last: None,
            done: false,
        };

        Box::pin(stream::unfold(state, move |mut st| async move {
            loop {
                if st.done {
                    return None;
                }
                if st.current.is_none() {
                    let step = self.steps.get(st.index)?;
                    info!(
                        chain = %self.name,
                        step = st.index,
                        agent = %step.name(),
                        "Starting chain step"
                    );
                    let input = std::mem::take(&mut st.input);
                    st.current = Some(step.run(input, max_iterations));
                    st.last = None;
                }

                let next = match st.current.as_mut() {
                    Some(events) => events.next().await,
                    None => None,
                };
                match next {
                    Some(mut event) => {
                        if let Some(err) = event.error.take() {
                            warn!(chain = %self.name, step = st.index, error = %err, "Chain step failed");
                            st.done = true;
                            let failed = SkeinError::ChainStepFailed {
                                index: st.index,
                                source: Box::new(err),
                            };
                            return Some((StepEvent::error(event.agent_name, failed), st));
                        }
                        if let Some(content) = event.content() {
                            st.last = Some(content.to_string());
                        }
                        return Some((event, st));
                    }
                    None => {
                        st.current = None;
                        st.input = st.last.take().unwrap_or_default();
                        st.index += 1;
                    }
                }
            }
        }))
    }
}
