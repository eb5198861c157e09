use crate::*;

fn status<'a>(connected: &'a str, seq: Option<&'a str>) -> Vec<(&'a str, &'a str)> {
    let mut extra = vec![
        ("relay_protocol", "OSSH"),
        ("session_id", "5e551011"),
        ("connected", connected),
    ];
    if let Some(seq) = seq {
        extra.push(("seq", seq));
    }
    common(&extra)
}

fn connected() -> Vec<(&'static str, &'static str)> {
    common(&[("relay_protocol", "OSSH"), ("session_id", "5e551011")])
}

#[tokio::test]
async fn test_connect_status_disconnect_produces_one_record() -> Result<()> {
    let server = TestServer::start().await?;

    assert_eq!(server.get("/connected", &connected()).await?.0, 200);
    assert_eq!(
        server
            .post("/status", &status("1", None), r#"{"bytes_transferred":1000,"page_views":4}"#)
            .await?
            .0,
        200
    );
    assert_eq!(
        server
            .post("/status", &status("0", None), r#"{"bytes_transferred":24}"#)
            .await?
            .0,
        200
    );

    server.wait_for_sessions(1, Duration::from_secs(5)).await?;
    let sessions = server.sink.sessions();
    assert_eq!(sessions.len(), 1);
    let record = &sessions[0];
    assert_eq!(record.session_id.as_str(), "5e551011");
    assert_eq!(record.bytes_transferred, 1024);
    assert_eq!(record.duration_secs, record.end_time - record.start_time);
    assert_eq!(record.fields.get("relay_protocol").map(String::as_str), Some("OSSH"));
    assert!(!record.partial);
    assert_eq!(server.fragment_count(), 0);

    assert_eq!(server.sink.count("connected"), 1);
    assert_eq!(server.sink.count("status"), 2);
    Ok(())
}

#[tokio::test]
async fn test_reconnect_flushes_first_span_immediately() -> Result<()> {
    let server = TestServer::start().await?;

    server.get("/connected", &connected()).await?;
    server
        .post("/status", &status("1", None), r#"{"bytes_transferred":100}"#)
        .await?;
    server.get("/connected", &connected()).await?;

    // Flushed inline by the second connect, before any expiry.
    let sessions = server.sink.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].bytes_transferred, 100);
    assert_eq!(server.fragment_count(), 1);

    server.wait_for_sessions(2, Duration::from_secs(5)).await?;
    let sessions = server.sink.sessions();
    assert_eq!(sessions[1].bytes_transferred, 0);
    assert_ne!(sessions[0].fragment_id, sessions[1].fragment_id);
    Ok(())
}

#[tokio::test]
async fn test_orphaned_session_flushes_once_after_idle_window() -> Result<()> {
    let server = TestServer::start().await?;
    server.get("/connected", &connected()).await?;

    server.wait_for_sessions(1, Duration::from_secs(5)).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(server.sink.sessions().len(), 1);
    assert_eq!(server.fragment_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_redelivered_status_with_seq_is_counted_once() -> Result<()> {
    let server = TestServer::start().await?;
    server.get("/connected", &connected()).await?;

    let body = r#"{"bytes_transferred":50}"#;
    server.post("/status", &status("1", Some("1")), body).await?;
    server.post("/status", &status("1", Some("1")), body).await?;
    server.post("/status", &status("0", Some("2")), body).await?;

    server.wait_for_sessions(1, Duration::from_secs(5)).await?;
    assert_eq!(server.sink.sessions()[0].bytes_transferred, 100);
    Ok(())
}

#[tokio::test]
async fn test_status_without_connect_yields_partial_record() -> Result<()> {
    let server = TestServer::start().await?;
    server
        .post("/status", &status("0", None), r#"{"bytes_transferred":7}"#)
        .await?;

    server.wait_for_sessions(1, Duration::from_secs(5)).await?;
    let record = &server.sink.sessions()[0];
    assert!(record.partial);
    assert_eq!(record.bytes_transferred, 7);
    Ok(())
}

#[tokio::test]
async fn test_legacy_connected_is_logged_only() -> Result<()> {
    let server = TestServer::start().await?;
    let (code, body) = server
        .get("/connected", &common(&[("vpn_client_ip_address", "10.8.0.2")]))
        .await?;
    assert_eq!(code, 200);
    assert!(body.is_empty());
    assert_eq!(server.sink.count("connected"), 1);
    assert_eq!(server.fragment_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_is_logged() -> Result<()> {
    let server = TestServer::start().await?;
    let (code, _) = server
        .get("/failed", &common(&[("relay_protocol", "SSH"), ("error_code", "3")]))
        .await?;
    assert_eq!(code, 200);
    assert_eq!(server.sink.count("failed"), 1);
    Ok(())
}
