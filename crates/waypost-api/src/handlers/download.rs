//! /download: the client build for the requester's channel and sponsor.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::extract::{ConnectInfo, State};
use axum::http::header;
use axum::response::IntoResponse;

use super::{accept, client_region, ApiState, QueryPairs, Rejection};

/// Both ids are hex by the time they get here, so the name cannot escape
/// the download directory.
pub fn build_path(state: &ApiState, propagation_channel_id: &str, sponsor_id: &str) -> PathBuf {
    state
        .download_dir
        .join(format!("client-{propagation_channel_id}-{sponsor_id}.bin"))
}

pub async fn handle_download(
    State(state): State<ApiState>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    query: QueryPairs,
) -> Result<impl IntoResponse, Rejection> {
    let accepted = accept(&state, "download", query)?;
    let identity = &accepted.identity;
    let path = build_path(&state, &identity.propagation_channel_id, &identity.sponsor_id);

    let contents = tokio::fs::read(&path).await.map_err(|e| {
        tracing::info!(path = %path.display(), error = %e, "download not available");
        Rejection::NotFound
    })?;

    tracing::info!(
        region = %client_region(&state, client),
        propagation_channel_id = %identity.propagation_channel_id,
        sponsor_id = %identity.sponsor_id,
        bytes = contents.len(),
        "download served"
    );
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        contents,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{client, fixture, query, SECRET};
    use axum::body::to_bytes;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn serves_matching_build_or_404() {
        let f = fixture();
        let channel = waypost_core::secret::random_hex(4);
        let pairs = [
            ("propagation_channel_id", channel.as_str()),
            ("sponsor_id", "0b"),
            ("client_version", "3"),
            ("server_secret", SECRET),
        ];

        let missing = handle_download(State(f.state.clone()), ConnectInfo(client()), query(&pairs))
            .await
            .into_response();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let path = build_path(&f.state, &channel, "0b");
        std::fs::write(&path, b"build").unwrap();
        let served = handle_download(State(f.state.clone()), ConnectInfo(client()), query(&pairs))
            .await
            .into_response();
        assert_eq!(served.status(), StatusCode::OK);
        let body = to_bytes(served.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"build");
        let _ = std::fs::remove_file(&path);
    }
}
