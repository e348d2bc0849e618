//! Line-delimited JSON response bodies for run event streams.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::convert::Infallible;
use stepwise_runtime::{RunEvent, RunHandle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
pub const RUN_ID_HEADER: &str = "x-stepwise-run-id";
pub const SESSION_ID_HEADER: &str = "x-stepwise-session-id";

/// One encoded event per chunk, each terminated by `\n`.
///
/// Dropping the stream before the channel closes cancels the run.
pub fn ndjson_body_stream(
    mut events: mpsc::Receiver<RunEvent>,
    cancel: CancellationToken,
) -> impl futures::Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let guard = cancel.drop_guard();
    async_stream::stream! {
        while let Some(event) = events.recv().await {
            match event.to_ndjson_line() {
                Ok(line) => yield Ok::<Bytes, Infallible>(Bytes::from(line)),
                Err(e) => tracing::warn!(kind = event.kind(), error = %e, "failed to encode run event"),
            }
        }
        // Channel closed after the terminal event; nothing left to cancel.
        guard.disarm();
    }
}

/// Stream a started run back to the caller.
pub fn ndjson_response(handle: RunHandle) -> Response {
    let RunHandle {
        run_id,
        session_id,
        lane,
        events,
        cancel,
        join,
    } = handle;

    let task_run_id = run_id.clone();
    tokio::spawn(async move {
        match join.await {
            Ok(outcome) => tracing::debug!(
                run_id = %task_run_id,
                status = outcome.status.as_str(),
                "Run task finished"
            ),
            Err(e) => tracing::error!(run_id = %task_run_id, lane = %lane, error = %e, "Run task failed"),
        }
    });

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(NDJSON_CONTENT_TYPE));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    insert_id(&mut headers, RUN_ID_HEADER, &run_id);
    insert_id(&mut headers, SESSION_ID_HEADER, &session_id);

    (headers, Body::from_stream(ndjson_body_stream(events, cancel))).into_response()
}

fn insert_id(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}
