//! Server-Sent Events stream of workflow progress.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use orchestrator::events::WorkflowEvent;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::state::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Build the SSE frame for one event; `None` if it cannot be serialized.
fn to_sse_event(event: &WorkflowEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Event::default().event("workflow").data(json)),
        Err(err) => {
            warn!(error = %err, "failed to serialize workflow event");
            None
        }
    }
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.orchestrator.subscribe();
    debug!("SSE client connected");

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(frame) = to_sse_event(&event) {
                        yield Ok(frame);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL).text("ping"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator::core::types::TaskStatus;

    #[test]
    fn status_change_becomes_workflow_frame() {
        let event = WorkflowEvent::TaskStatusChanged {
            task_id: "main".to_string(),
            status: TaskStatus::Completed,
            role: None,
        };
        assert!(to_sse_event(&event).is_some());
    }
}
