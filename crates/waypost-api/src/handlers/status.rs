//! /status: periodic usage report, and the disconnect notice.
//!
//! `connected=1` refreshes the session, `connected=0` ends it. The usage
//! counters ride in an optional JSON body.

use std::net::SocketAddr;

use axum::extract::rejection::BytesRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use bytes::Bytes;
use serde::Deserialize;

use waypost_core::session::now_secs;
use waypost_services::StatsEvent;

use super::{accept, client_region, ApiState, QueryPairs, Rejection};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UsageReport {
    pub bytes_transferred: u64,
    pub page_views: u64,
    pub https_requests: u64,
}

pub async fn handle_status(
    State(state): State<ApiState>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    query: QueryPairs,
    body: Result<Bytes, BytesRejection>,
) -> Result<StatusCode, Rejection> {
    let accepted = accept(&state, "status", query)?;
    let invalid = |e| accepted.invalid(e);
    let session_id = accepted.params.session_id().map_err(invalid)?;
    let connected = accepted.params.connected_flag().map_err(invalid)?;
    let seq = accepted.params.seq().map_err(invalid)?;
    let body = body.map_err(|_| Rejection::Body)?;

    let usage = if body.is_empty() {
        UsageReport::default()
    } else {
        match serde_json::from_slice::<UsageReport>(&body) {
            Ok(u) => u,
            Err(e) => {
                // Accepted so the client stops retrying, but nothing recorded.
                tracing::info!(session_id = %session_id, error = %e, "ignoring malformed usage body");
                return Ok(StatusCode::OK);
            }
        }
    };

    let now = now_secs();
    let outcome = if connected {
        state
            .tracker
            .on_status(&session_id, usage.bytes_transferred, seq, now)
    } else {
        state
            .tracker
            .on_disconnect(&session_id, usage.bytes_transferred, seq, now)
    }
    .map_err(|e| Rejection::Tracker(accepted.request, e))?;

    let region = client_region(&state, client);
    state.sink.emit(StatsEvent::Status {
        request: accepted.summary(&state, &region),
        session: session_id.to_string(),
        connected,
        bytes_transferred: usage.bytes_transferred,
        page_views: usage.page_views,
        https_requests: usage.https_requests,
    });
    tracing::debug!(session_id = %session_id, connected, ?outcome, "status applied");
    Ok(StatusCode::OK)
}
