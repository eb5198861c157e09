//! /connected: the tunnel came up.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;

use waypost_core::session::now_secs;
use waypost_core::validate::SessionRef;
use waypost_services::{ConnectRecord, StatsEvent};

use super::{accept, client_region, ApiState, QueryPairs, Rejection};

pub async fn handle_connected(
    State(state): State<ApiState>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    query: QueryPairs,
) -> Result<StatusCode, Rejection> {
    let accepted = accept(&state, "connected", query)?;
    let session = accepted
        .params
        .session_ref()
        .map_err(|e| accepted.invalid(e))?;

    match session {
        SessionRef::Id(session_id) => {
            let now = now_secs();
            // The authenticator saw the real client address; prefer its answer.
            let region = match state
                .geo
                .region(&session_id, now)
                .map_err(|e| Rejection::Store(accepted.request, e))?
            {
                Some(region) => region,
                None => client_region(&state, client),
            };

            let summary = accepted.summary(&state, &region);
            let mut fields = BTreeMap::new();
            fields.insert("server".to_string(), summary.server.clone());
            fields.insert("region".to_string(), region.clone());
            fields.insert(
                "propagation_channel_id".to_string(),
                summary.propagation_channel_id.clone(),
            );
            fields.insert("sponsor_id".to_string(), summary.sponsor_id.clone());
            fields.insert("client_version".to_string(), summary.client_version.to_string());
            fields.insert(
                "relay_protocol".to_string(),
                summary.relay_protocol.as_str().to_string(),
            );

            state
                .tracker
                .on_connect(
                    ConnectRecord {
                        session_id: session_id.clone(),
                        fields,
                    },
                    now,
                )
                .map_err(|e| Rejection::Tracker(accepted.request, e))?;
            // Left in place on failure; the entry expires on its own.
            if let Err(e) = state.geo.forget(&session_id) {
                tracing::warn!(session_id = %session_id, error = %e, "geo entry not removed");
            }

            state.sink.emit(StatsEvent::Connected {
                request: summary,
                session: session_id.to_string(),
            });
        }
        SessionRef::LegacyAddress(address) => {
            // Pre-session clients: stats only, no lifecycle tracking.
            let region = client_region(&state, client);
            state.sink.emit(StatsEvent::Connected {
                request: accepted.summary(&state, &region),
                session: address.to_string(),
            });
        }
    }
    Ok(StatusCode::OK)
}
