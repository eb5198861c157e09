//! /failed: the client gave up on this server.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;

use waypost_services::StatsEvent;

use super::{accept, client_region, ApiState, QueryPairs, Rejection};

pub async fn handle_failed(
    State(state): State<ApiState>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    query: QueryPairs,
) -> Result<StatusCode, Rejection> {
    let accepted = accept(&state, "failed", query)?;
    let error_code = accepted
        .params
        .error_code()
        .map_err(|e| accepted.invalid(e))?;

    let region = client_region(&state, client);
    state.sink.emit(StatsEvent::Failed {
        request: accepted.summary(&state, &region),
        error_code,
    });
    Ok(StatusCode::OK)
}
