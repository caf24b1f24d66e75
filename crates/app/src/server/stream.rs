//! Server-Sent Event streams of map commands.
//!
//! Each connection subscribes to the `drivers` subtree, re-derives its view
//! on every notification and on a periodic tick (so LIVE turns OFFLINE without
//! new writes), and forwards the presenter's widget calls as events.

use std::{fmt::Display, time::Duration};

use actix_web::{
    HttpRequest, HttpResponse, HttpResponseBuilder,
    http::{StatusCode, header},
    web::{self, Bytes},
};
use async_stream::stream;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error};
use tracking::{
    CommandBuffer, LiveAggregator, LocationStore, SingleDriverTracker, Subscription, store::paths,
};

use super::ServerState;

const RESTALE_TICK: Duration = Duration::from_secs(5);

/// Suffix on live event ids sent once the page's map has been centred. The
/// browser echoes the last id in `Last-Event-ID` when it reconnects.
const CENTERED_SUFFIX: &str = "-c";

fn live_event_id(sequence: u64, centered: bool) -> String {
    if centered {
        format!("{sequence}{CENTERED_SUFFIX}")
    } else {
        sequence.to_string()
    }
}

/// Aggregator for a live stream connection. A reconnect from a page whose
/// map is already centred must not recenter it again.
fn live_aggregator(req: &HttpRequest, stale_after: Duration) -> LiveAggregator {
    let resumed = req
        .headers()
        .get("Last-Event-ID")
        .and_then(|id| id.to_str().ok())
        .is_some_and(|id| id.trim().ends_with(CENTERED_SUFFIX));
    if resumed {
        debug!("live stream resumed on a centred map");
        LiveAggregator::resumed(stale_after)
    } else {
        LiveAggregator::new(stale_after)
    }
}

/// Bridge store notifications for `drivers` into an async channel.
fn subscribe_drivers(
    state: &ServerState,
) -> Result<(Subscription, mpsc::UnboundedReceiver<Option<Value>>), HttpResponse> {
    let (tx, rx) = mpsc::unbounded_channel::<Option<Value>>();
    let subscription = state
        .store
        .subscribe(
            paths::DRIVERS,
            Box::new(move |snapshot| {
                let _ = tx.send(snapshot);
            }),
        )
        .map_err(|err| {
            error!("failed to subscribe to drivers: {err}");
            HttpResponse::build(StatusCode::INTERNAL_SERVER_ERROR)
                .json(serde_json::json!({ "error": err.to_string() }))
        })?;
    Ok((subscription, rx))
}

/// Format one SSE chunk; `event` names the listener on the page.
fn sse_chunk(id: impl Display, event: Option<&str>, payload: &impl Serialize) -> Bytes {
    match serde_json::to_string(payload) {
        Ok(json) => {
            let mut chunk = String::with_capacity(json.len() + 48);
            if let Some(event) = event {
                chunk.push_str("event: ");
                chunk.push_str(event);
                chunk.push('\n');
            }
            chunk.push_str("id: ");
            chunk.push_str(&id.to_string());
            chunk.push('\n');
            chunk.push_str("data: ");
            chunk.push_str(&json);
            chunk.push_str("\n\n");
            Bytes::from(chunk)
        }
        Err(err) => Bytes::from(format!("event: error\ndata: {err}\n\n")),
    }
}

fn sse_response() -> HttpResponseBuilder {
    let mut builder = HttpResponse::Ok();
    builder
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
        .insert_header((header::ACCESS_CONTROL_EXPOSE_HEADERS, "Content-Type"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "text/event-stream"))
        .append_header(("Connection", "keep-alive"));
    builder
}

/// Stream map commands for the live map of every active driver.
pub(super) async fn live_stream(req: HttpRequest, state: web::Data<ServerState>) -> HttpResponse {
    let (subscription, mut updates) = match subscribe_drivers(&state) {
        Ok(bridge) => bridge,
        Err(response) => return response,
    };
    let presenter = state.presenter;
    let mut aggregator = live_aggregator(&req, state.stale_after);

    let stream = stream! {
        let _subscription = subscription;
        let mut widget = CommandBuffer::new();
        let mut snapshot: Option<Value> = None;
        let mut sequence: u64 = 0;
        let mut tick = actix_web::rt::time::interval(RESTALE_TICK);

        yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b"retry: 2000\n\n"));
        loop {
            tokio::select! {
                biased;
                update = updates.recv() => match update {
                    Some(update) => snapshot = update,
                    None => break,
                },
                _ = tick.tick() => {}
            }

            let now = Utc::now();
            let centered_before = aggregator.has_centered_once();
            let update = aggregator.apply(snapshot.as_ref(), now);
            metrics::gauge!("tracker_active_drivers").set(update.view.len() as f64);
            metrics::gauge!("tracker_live_drivers").set(update.view.live_count() as f64);
            presenter.present_live(&mut widget, &update, now);

            sequence += 1;
            let id = live_event_id(sequence, centered_before);
            yield Ok(sse_chunk(id, Some("view"), &update.view));
            let centered = aggregator.has_centered_once();
            for command in widget.drain() {
                sequence += 1;
                yield Ok(sse_chunk(live_event_id(sequence, centered), None, &command));
            }
        }
        debug!("live stream closed");
    };

    sse_response().streaming(stream)
}

/// Stream map commands following one driver.
pub(super) async fn track_stream(
    path: web::Path<String>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let (subscription, mut updates) = match subscribe_drivers(&state) {
        Ok(bridge) => bridge,
        Err(response) => return response,
    };
    let presenter = state.presenter;
    let mut tracker = SingleDriverTracker::with_stale_after(path.into_inner(), state.stale_after);

    let stream = stream! {
        let _subscription = subscription;
        let mut widget = CommandBuffer::new();
        let mut snapshot: Option<Value> = None;
        let mut sequence: u64 = 0;
        let mut tick = actix_web::rt::time::interval(RESTALE_TICK);

        yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b"retry: 2000\n\n"));
        loop {
            tokio::select! {
                biased;
                update = updates.recv() => match update {
                    Some(update) => snapshot = update,
                    None => break,
                },
                _ = tick.tick() => {}
            }

            let now = Utc::now();
            let update = tracker.apply(snapshot.as_ref(), now);
            presenter.present_driver(&mut widget, &update, now);

            sequence += 1;
            yield Ok(sse_chunk(sequence, Some("driver"), &update.view));
            for command in widget.drain() {
                sequence += 1;
                yield Ok(sse_chunk(sequence, None, &command));
            }
        }
        debug!(driver_id = tracker.driver_id(), "tracking stream closed");
    };

    sse_response().streaming(stream)
}
