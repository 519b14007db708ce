use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use agentflow_protocol::{ApiError, ErrorCode, RunEvent, encode_frame};
use axum::extract::{Query, State};
use axum::http::header::{CACHE_CONTROL, HeaderName};
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::Deserialize;

use crate::AppState;
use crate::api::ApiFailure;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    run_id: Option<String>,
    since_seq: Option<String>,
}

/// GET /api/stream - Replay a run's retained events, then follow it live.
///
/// Without `runId` the connection follows the global feed.
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Result<impl IntoResponse, ApiFailure> {
    let run_id = query.run_id.unwrap_or_default();
    let since_seq = if run_id.is_empty() {
        0
    } else {
        parse_since_seq(query.since_seq.as_deref())?
    };

    let mut sub = state.bus.replay_and_subscribe(&run_id, since_seq);
    tracing::debug!(run_id = %run_id, since_seq, truncated = sub.truncated(), "stream opened");

    let events = async_stream::stream! {
        yield Ok::<_, Infallible>(Event::default().comment("ok"));
        for event in sub.take_replay() {
            match frame(&event) {
                Some(frame) => yield Ok(frame),
                None => return,
            }
        }
        while let Some(event) = sub.recv().await {
            match frame(&event) {
                Some(frame) => yield Ok(frame),
                None => return,
            }
        }
    };

    let headers = [
        (CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
    ];
    Ok((
        headers,
        Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)),
    ))
}

fn parse_since_seq(raw: Option<&str>) -> Result<u64, ApiFailure> {
    match raw {
        None | Some("") => Ok(0),
        Some(raw) => raw.parse().map_err(|_| {
            ApiFailure(
                ApiError::new(ErrorCode::InvalidQuery, "sinceSeq must be an unsigned integer.")
                    .with_hint("Use /api/stream?runId=<id>&sinceSeq=<n>."),
            )
        }),
    }
}

/// One `data:` frame, or `None` when the event cannot be sent on one line.
fn frame(event: &RunEvent) -> Option<Event> {
    match encode_frame(event) {
        Ok(line) => Some(Event::default().data(line)),
        Err(err) => {
            tracing::warn!(run_id = %event.run_id, seq = event.seq, "closing stream: {err}");
            None
        }
    }
}
