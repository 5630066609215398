//! Dashboard event stream
//!
//! Forwards pipeline events to dashboards. Raw position batches are left
//! to the socket hub.

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use fleet_common::events::FleetEvent;
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::AppState;

/// GET /events
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE client connected");
    let mut rx = state.event_bus.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(FleetEvent::PositionsPersisted { .. }) => {}
                Ok(event) => {
                    let event_type = event.event_type().to_string();
                    match serde_json::to_string(&event) {
                        Ok(data) => {
                            debug!("SSE: forwarding {}", event_type);
                            yield Ok(Event::default().event(event_type).data(data));
                        }
                        Err(e) => warn!("SSE: failed to serialize {}: {}", event_type, e),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE client lagged behind the event bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
