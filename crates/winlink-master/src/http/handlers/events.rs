//! Server-sent stream of registry task events.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::{self, Stream};
use tokio::sync::broadcast;
use tracing::warn;

use winlink_core::TaskEvent;

use crate::state::MasterState;

/// Stream every task transition as it happens.
///
/// Each SSE event is named after the transition kind and carries the
/// [`TaskEvent`] as JSON.
pub async fn stream_events(
    State(state): State<Arc<MasterState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(event_stream(state.registry.subscribe())).keep_alive(KeepAlive::default())
}

fn event_stream(
    receiver: broadcast::Receiver<TaskEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    stream::unfold(receiver, |mut receiver| async move {
        match receiver.recv().await {
            Ok(event) => Some((Ok(to_sse(&event)), receiver)),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Event stream lagged, skipping events");
                Some((
                    Ok(Event::default().comment(format!("skipped {} events", n))),
                    receiver,
                ))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    })
}

fn to_sse(event: &TaskEvent) -> Event {
    match Event::default().event(event.kind.as_str()).json_data(event) {
        Ok(sse) => sse,
        Err(e) => Event::default().comment(format!("unserializable event: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use winlink_core::{Payload, Priority, ResourceLimits, TaskSpec};

    use crate::registry::TaskRegistry;

    #[tokio::test]
    async fn test_stream_yields_registry_events() {
        let registry = TaskRegistry::new();
        let mut events = Box::pin(event_stream(registry.subscribe()));

        let id = registry
            .submit(
                TaskSpec::new("job", Payload::code("sh", "true"))
                    .with_priority(Priority::Normal)
                    .with_resources(ResourceLimits::default()),
            )
            .await
            .unwrap();
        registry.cancel(&id, "").await.unwrap();

        assert!(events.next().await.unwrap().is_ok());
        assert!(events.next().await.unwrap().is_ok());

        drop(registry);
        assert!(events.next().await.is_none());
    }
}
