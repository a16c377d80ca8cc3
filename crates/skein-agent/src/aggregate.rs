use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use skein_core::error::Result;
use skein_core::types::StepEvent;

/// Fold a step-event stream into the run's final text.
///
/// The first event carrying an error aborts and surfaces that error.
/// Otherwise the last non-empty message content wins; an exhausted stream
/// with no content yields an empty string. `on_chunk` sees every contentful
/// event in emission order. The next event is not polled until the callback
/// has returned.
pub async fn aggregate<S>(
    events: S,
    mut on_chunk: Option<&mut (dyn FnMut(&str) + Send)>,
) -> Result<String>
where
    S: Stream<Item = StepEvent>,
{
    let mut events = std::pin::pin!(events);
    let mut last = String::new();
    let mut count = 0usize;

    while let Some(event) = events.next().await {
        count += 1;
        if let Some(err) = event.error {
            warn!(agent = %event.agent_name, error = %err, "Step event carried an error");
            return Err(err);
        }
        if let Some(content) = event.message.as_ref().map(|m| m.content.as_str()) {
            if content.trim().is_empty() {
                continue;
            }
            if let Some(cb) = on_chunk.as_deref_mut() {
                cb(content);
            }
            last = content.to_string();
        }
    }

    debug!(events = count, chars = last.len(), "Step events aggregated");
    Ok(last)
}
