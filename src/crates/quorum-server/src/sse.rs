//! SSE Gateway (§4.I): `GET /api/v1/sse/events?project=<id>` streams the
//! event bus as `text/event-stream`. Frames are rendered by the
//! already-implemented `quorum_bus::Event::to_sse_frame()`, so this module
//! only handles subscription, project filtering, and heartbeats — it never
//! re-serializes an event itself.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use quorum_bus::{Event, EventBus};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct SseQuery {
    pub project: Option<String>,
}

pub async fn sse_handler(State(bus): State<Arc<EventBus>>, Query(query): Query<SseQuery>) -> Response {
    let (subscription_id, receiver) = bus.subscribe().await;
    let bus_for_cleanup = bus.clone();
    let project_filter = query.project;

    let stream = async_stream::stream! {
        yield Ok::<_, Infallible>(Event::Connected { timestamp: chrono::Utc::now() }.to_sse_frame().into_bytes());

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                event = receiver.recv() => {
                    match event {
                        Some(event) => {
                            if let Some(project) = &project_filter {
                                if let Some(event_project) = event.project_id() {
                                    if event_project != project {
                                        continue;
                                    }
                                }
                            }
                            yield Ok(event.to_sse_frame().into_bytes());
                        }
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    yield Ok(b": heartbeat\n\n".to_vec());
                }
            }
        }

        info!(subscription_id = ?subscription_id, dropped = receiver.dropped(), "sse connection closed");
        bus_for_cleanup.unsubscribe(subscription_id).await;
    };

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .expect("static SSE response headers are always valid")
        .into_response()
}
