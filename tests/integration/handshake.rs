use crate::*;

use std::collections::HashSet;
use std::net::Ipv4Addr;

fn psk_line(body: &str) -> Option<&str> {
    body.lines().last()?.strip_prefix("PSK: ")
}

#[tokio::test]
async fn test_handshake_body_and_discovery() -> Result<()> {
    let server = TestServer::start().await?;
    let (status, body) = server
        .get("/handshake", &common(&[("relay_protocol", "SSH"), ("known_server", PEER_A)]))
        .await?;
    assert_eq!(status, 200);

    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines[0], "Homepage: https://home.example/");
    assert_eq!(lines[1], "Upgrade: 10");

    // Config lists PEER_A twice; it goes out once.
    let servers: Vec<&str> = lines.iter().filter(|l| l.starts_with("Server: ")).copied().collect();
    assert_eq!(servers.len(), 2);
    assert_eq!(servers.iter().collect::<HashSet<_>>().len(), 2);

    let psk = psk_line(&body).context("PSK must be the last line")?;
    let pushed = server.psk_sink.pushed.lock().unwrap().clone();
    assert_eq!(pushed, vec![(1, psk.to_string())]);

    assert_eq!(server.sink.count("handshake"), 1);
    assert_eq!(
        server.sink.discoveries(),
        vec![
            (PEER_A.parse::<Ipv4Addr>()?, false),
            (PEER_B.parse::<Ipv4Addr>()?, true),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_each_unknown_peer_is_new_exactly_once_per_handshake() -> Result<()> {
    let server = TestServer::start().await?;
    server.get("/handshake", &common(&[])).await?;
    server
        .get("/handshake", &common(&[("known_server", PEER_A), ("known_server", PEER_B)]))
        .await?;

    let discoveries = server.sink.discoveries();
    let new: Vec<_> = discoveries.iter().filter(|(_, new)| *new).collect();
    assert_eq!(new.len(), 2);
    let counts = server.state.peers.counts(PEER_A.parse()?);
    assert_eq!((counts.new, counts.known), (1, 1));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_handshakes_get_distinct_ordered_keys() -> Result<()> {
    let server = Arc::new(TestServer::start().await?);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let server = server.clone();
        tasks.push(tokio::spawn(async move {
            server.get("/handshake", &common(&[])).await
        }));
    }

    let mut served = HashSet::new();
    for task in tasks {
        let (status, body) = task.await??;
        assert_eq!(status, 200);
        let psk = psk_line(&body).context("missing PSK line")?.to_string();
        assert!(served.insert(psk), "two clients were handed the same key");
    }

    let pushed = server.psk_sink.pushed.lock().unwrap().clone();
    let sequences: Vec<u64> = pushed.iter().map(|(s, _)| *s).collect();
    assert_eq!(sequences, (1..=16).collect::<Vec<_>>());
    // Every key a client saw was pushed to the transport first.
    let pushed_keys: HashSet<String> = pushed.into_iter().map(|(_, k)| k).collect();
    assert_eq!(served, pushed_keys);
    assert_eq!(server.state.psk.snapshot().sequence, 16);
    Ok(())
}
