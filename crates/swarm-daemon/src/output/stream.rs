//! Polling subscription over an output buffer.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_stream::Stream;

use super::buffer::OutputLine;
use super::store::OutputStore;
use crate::process::ProcessRegistry;

/// Item produced by [`subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputEvent {
    Line { offset: i64, line: OutputLine },
    /// Nothing new for a while; lets the transport detect dead peers.
    Keepalive,
    /// No drain worker remains for the project. Always the last item.
    Done,
}

/// Boxed output subscription.
pub type OutputStream = Pin<Box<dyn Stream<Item = OutputEvent> + Send>>;

/// Stream cadence.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub poll_interval: Duration,
    /// Idle polls between keepalives; 0 disables keepalives.
    pub keepalive_every: u32,
}

/// Subscribe to a project's combined output (or one agent's) from `from_offset`.
///
/// The stream yields appended lines each poll and ends with
/// [`OutputEvent::Done`] once the project has no active drain worker and
/// every line written before that moment has been delivered. It also ends
/// when the buffers it follows are replaced by a new run, since its offset
/// means nothing in the new ones. Dropping the stream cancels it.
pub async fn subscribe(
    store: Arc<OutputStore>,
    registry: Arc<ProcessRegistry>,
    project_id: String,
    agent: Option<String>,
    from_offset: i64,
    options: StreamOptions,
) -> OutputStream {
    let page_size = i64::try_from(store.capacity()).unwrap_or(i64::MAX);
    let mut generation = store.generation(&project_id).await;

    let stream = async_stream::stream! {
        let mut offset = from_offset;
        let mut idle_polls = 0u32;

        loop {
            // Sampled before reading: a worker that is gone by now has already
            // appended its final lines.
            let active = registry.has_active(&project_id).await;
            let (current, page) = store
                .read_tagged(&project_id, agent.as_deref(), offset, page_size)
                .await;

            if generation.is_some() && current != generation {
                yield OutputEvent::Done;
                break;
            }
            generation = current;

            let got_lines = !page.lines.is_empty();
            for (i, line) in page.lines.into_iter().enumerate() {
                let line_offset = page.offset + i64::try_from(i).unwrap_or(0);
                yield OutputEvent::Line { offset: line_offset, line };
            }
            offset = page.next_offset;

            if got_lines {
                idle_polls = 0;
                if page.has_more {
                    continue;
                }
            }

            if !active {
                yield OutputEvent::Done;
                break;
            }

            if !got_lines {
                idle_polls += 1;
                if options.keepalive_every > 0 && idle_polls >= options.keepalive_every {
                    idle_polls = 0;
                    yield OutputEvent::Keepalive;
                }
            }

            tokio::time::sleep(options.poll_interval).await;
        }
    };

    Box::pin(stream)
}
