//! /handshake: home pages, upgrade notice, peer list, and a fresh PSK.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::header;
use axum::response::IntoResponse;

use waypost_services::StatsEvent;

use super::{accept, client_region, Accepted, ApiState, QueryPairs, Rejection};

/// Response lines before the PSK, in wire order.
fn handshake_lines(state: &ApiState, accepted: &Accepted, region: &str) -> Vec<String> {
    let identity = &accepted.identity;
    let mut lines = Vec::new();
    for url in state.catalog.home_pages(&identity.sponsor_id, region) {
        lines.push(format!("Homepage: {url}"));
    }
    if let Some(version) = state
        .catalog
        .upgrade_for(&identity.propagation_channel_id, identity.client_version)
    {
        lines.push(format!("Upgrade: {version}"));
    }
    for server in state.peers.servers() {
        lines.push(format!("Server: {}", server.encoded()));
    }
    lines
}

pub async fn handle_handshake(
    State(state): State<ApiState>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    query: QueryPairs,
) -> Result<impl IntoResponse, Rejection> {
    let accepted = accept(&state, "handshake", query)?;
    let known = accepted
        .params
        .known_servers()
        .map_err(|e| accepted.invalid(e))?;
    let region = client_region(&state, client);

    let mut lines = handshake_lines(&state, &accepted, &region);

    // The key changes only once the rest of the body exists. A concurrent
    // handshake may rotate again before this client uses it; clients retry.
    let psk = state.psk.rotate().map_err(Rejection::Psk)?;
    lines.push(format!("PSK: {}", psk.psk.as_str()));

    let discoveries = state.peers.discover(&known);
    state.peers.record(&discoveries);
    state.sink.emit(StatsEvent::Handshake {
        request: accepted.summary(&state, &region),
        psk_sequence: psk.sequence,
    });
    for d in discoveries {
        state.sink.emit(StatsEvent::Discovery {
            request: accepted.summary(&state, &region),
            discovered_server: d.address,
            new: d.new,
        });
    }
    tracing::debug!(
        lines = lines.len(),
        psk_sequence = psk.sequence,
        fingerprint = %psk.psk.fingerprint(),
        "handshake answered"
    );

    Ok(([(header::CONTENT_TYPE, "text/plain")], lines.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{client, fixture, query, SECRET};
    use axum::body::to_bytes;
    use axum::http::StatusCode;

    async fn call(state: &ApiState, pairs: &[(&str, &str)]) -> (StatusCode, String) {
        let response = handle_handshake(State(state.clone()), ConnectInfo(client()), query(pairs))
            .await
            .into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn valid<'a>(extra: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
        let mut pairs = vec![
            ("propagation_channel_id", "0a"),
            ("sponsor_id", "0b"),
            ("client_version", "3"),
            ("server_secret", SECRET),
        ];
        pairs.extend_from_slice(extra);
        pairs
    }

    #[tokio::test]
    async fn body_lists_pages_upgrade_servers_then_psk() {
        let f = fixture();
        let (status, body) = call(&f.state, &valid(&[("known_server", "192.0.2.10")])).await;
        assert_eq!(status, StatusCode::OK);

        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines[0], "Homepage: https://home.example/");
        assert_eq!(lines[1], "Upgrade: 9");
        assert!(lines[2].starts_with("Server: "));
        assert!(lines[3].starts_with("Server: "));
        assert_eq!(lines.len(), 5);

        let current = f.state.psk.snapshot();
        assert_eq!(current.sequence, 1);
        assert_eq!(lines[4], format!("PSK: {}", current.psk.as_str()));

        assert_eq!(f.sink.count("handshake"), 1);
        assert_eq!(
            f.sink.discoveries(),
            vec![
                ("192.0.2.10".parse().unwrap(), false),
                ("192.0.2.11".parse().unwrap(), true),
            ]
        );
    }

    #[tokio::test]
    async fn legacy_client_id_is_accepted() {
        let f = fixture();
        let (status, _) = call(
            &f.state,
            &[
                ("client_id", "0a"),
                ("sponsor_id", "0b"),
                ("client_version", "9"),
                ("server_secret", SECRET),
            ],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn rejected_requests_leave_no_trace() {
        let f = fixture();
        let cases: Vec<Vec<(&str, &str)>> = vec![
            valid(&[("known_server", "not-an-ip")]),
            valid(&[("relay_protocol", "FTP")]),
            vec![("sponsor_id", "0b"), ("client_version", "3"), ("server_secret", SECRET)],
            vec![("propagation_channel_id", "0a"), ("sponsor_id", "0b"), ("client_version", "3")],
            vec![
                ("propagation_channel_id", "0a"),
                ("sponsor_id", "0b"),
                ("client_version", "3"),
                ("server_secret", "feedfacf"),
            ],
            vec![
                ("propagation_channel_id", "0a"),
                ("sponsor_id", "zz"),
                ("client_version", "3"),
                ("server_secret", SECRET),
            ],
        ];
        for pairs in cases {
            let (status, body) = call(&f.state, &pairs).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{pairs:?}");
            assert!(body.is_empty());
        }
        assert_eq!(f.state.psk.snapshot().sequence, 0);
        assert!(f.sink.events().is_empty());
        assert!(f.store.is_empty());
    }
}
