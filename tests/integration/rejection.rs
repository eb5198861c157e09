use crate::*;

/// Requests that must all be answered with an empty 404 and change nothing.
fn bad_requests() -> Vec<(&'static str, Vec<(&'static str, &'static str)>)> {
    vec![
        ("/handshake", vec![("sponsor_id", "beef"), ("client_version", "7"), ("server_secret", SECRET)]),
        ("/handshake", common(&[("known_server", "192.0.2.999")])),
        ("/handshake", common(&[("relay_protocol", "L2TP")])),
        (
            "/handshake",
            vec![
                ("propagation_channel_id", "cafe"),
                ("sponsor_id", "beef"),
                ("client_version", "7"),
                ("server_secret", "0123456789abcdee"),
            ],
        ),
        (
            "/handshake",
            vec![
                ("propagation_channel_id", "cafe"),
                ("sponsor_id", "beef"),
                ("client_version", "7"),
                ("server_secret", "not-hex"),
            ],
        ),
        ("/connected", common(&[("session_id", "xyz")])),
        ("/connected", common(&[("vpn_client_ip_address", "10.8.0")])),
        ("/failed", common(&[("error_code", "E1")])),
        ("/status", common(&[("session_id", "5e55"), ("connected", "2")])),
        ("/status", common(&[("session_id", "5e55"), ("connected", "1"), ("seq", "-1")])),
        ("/download", vec![("propagation_channel_id", "cafe"), ("sponsor_id", "beef"), ("server_secret", SECRET)]),
    ]
}

#[tokio::test]
async fn test_malformed_requests_get_empty_404_and_no_side_effects() -> Result<()> {
    let server = TestServer::start().await?;

    for (path, pairs) in bad_requests() {
        let (code, body) = server.get(path, &pairs).await?;
        assert_eq!(code, 404, "{path} {pairs:?}");
        assert!(body.is_empty(), "{path} leaked a body");
    }

    assert!(server.sink.events().is_empty());
    assert!(server.store.is_empty());
    assert!(server.psk_sink.pushed.lock().unwrap().is_empty());
    assert_eq!(server.state.psk.snapshot().sequence, 0);
    Ok(())
}

#[tokio::test]
async fn test_malformed_usage_body_is_accepted_and_ignored() -> Result<()> {
    let server = TestServer::start().await?;
    let pairs = common(&[("session_id", "5e55"), ("connected", "1")]);
    let (code, body) = server.post("/status", &pairs, "{\"bytes_transferred\": \"lots\"}").await?;
    assert_eq!(code, 200);
    assert!(body.is_empty());
    assert!(server.store.is_empty());
    assert!(server.sink.events().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_download_without_build_is_404() -> Result<()> {
    let server = TestServer::start().await?;
    let (code, body) = server
        .get(
            "/download",
            &[
                ("propagation_channel_id", "0ddba11"),
                ("sponsor_id", "beef"),
                ("client_version", "7"),
                ("server_secret", SECRET),
            ],
        )
        .await?;
    assert_eq!(code, 404);
    assert!(body.is_empty());
    Ok(())
}
