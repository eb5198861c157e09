//! waypost integration test harness.
//!
//! Each test starts its own web front-end on 127.0.0.1 with an ephemeral
//! port, in-memory collaborators, and short session windows, then talks to
//! it over real HTTP.
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use waypost_api::ApiState;
use waypost_core::config::{HomePageConfig, ServerEntryConfig, SponsorConfig, UpgradeConfig};
use waypost_services::{
    expiry_timer, FragmentStore, HandshakeCatalog, MemoryFragmentStore, MemorySink, PeerDirectory,
    PrefixRegionTable, PskError, PskRotator, PskSink, PskState, SessionGeo, SessionTracker,
    TrackerSettings,
};

mod handshake;
mod lifecycle;
mod rejection;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const SECRET: &str = "0123456789abcdef";
pub const SERVER_IP: &str = "192.0.2.1";
pub const PEER_A: &str = "192.0.2.10";
pub const PEER_B: &str = "192.0.2.11";

/// Every key the rotator pushed, in push order.
#[derive(Default)]
pub struct RecordingPskSink {
    pub pushed: Mutex<Vec<(u64, String)>>,
}

impl PskSink for RecordingPskSink {
    fn push(&self, state: &PskState) -> Result<(), PskError> {
        self.pushed
            .lock()
            .unwrap()
            .push((state.sequence, state.psk.as_str().to_string()));
        Ok(())
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: ApiState,
    pub store: MemoryFragmentStore,
    pub sink: MemorySink,
    pub psk_sink: Arc<RecordingPskSink>,
    pub client: reqwest::Client,
    shutdown: broadcast::Sender<()>,
}

impl TestServer {
    /// Fragments flush 2s after the last status, 1s after a disconnect.
    pub async fn start() -> Result<Self> {
        let store = MemoryFragmentStore::new();
        let sink = MemorySink::new();
        let psk_sink = Arc::new(RecordingPskSink::default());
        let (timer, events) = expiry_timer();
        let settings = TrackerSettings {
            fragment_ttl: Duration::from_secs(2),
            disconnect_ttl: Duration::from_secs(1),
            geo_ttl: Duration::from_secs(300),
        };
        let tracker = SessionTracker::new(
            Arc::new(store.clone()),
            timer.clone(),
            Arc::new(sink.clone()),
            settings,
        );

        let catalog = HandshakeCatalog::from_config(
            &[SponsorConfig {
                sponsor_id: "beef".into(),
                home_pages: vec![HomePageConfig {
                    region: "*".into(),
                    url: "https://home.example/".into(),
                }],
            }],
            &[UpgradeConfig {
                propagation_channel_id: "cafe".into(),
                client_version: 10,
            }],
        );
        let peer = |ip: &str| ServerEntryConfig {
            ip_address: ip.into(),
            web_server_port: 8443,
            web_server_secret: "aa".into(),
            certificate: "bb".into(),
        };
        let peers = PeerDirectory::from_config(&[peer(PEER_A), peer(PEER_B), peer(PEER_A)]);

        let state = ApiState {
            server_address: Arc::from(SERVER_IP),
            web_server_secret: Arc::from(SECRET),
            catalog: Arc::new(catalog),
            peers,
            psk: Arc::new(PskRotator::new(SERVER_IP, 16, psk_sink.clone())),
            tracker: tracker.clone(),
            geo: SessionGeo::new(Arc::new(store.clone()), timer.clone(), settings.geo_ttl),
            regions: Arc::new(PrefixRegionTable::default()),
            sink: Arc::new(sink.clone()),
            download_dir: Arc::new(std::env::temp_dir()),
        };

        let (shutdown, _) = broadcast::channel(1);
        tokio::spawn(timer.run(Duration::from_millis(50), shutdown.subscribe()));
        tokio::spawn(tracker.run_flush_listener(events, shutdown.subscribe()));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(waypost_api::serve(
            state.clone(),
            listener,
            64 * 1024,
            shutdown.subscribe(),
        ));

        Ok(Self {
            addr,
            state,
            store,
            sink,
            psk_sink,
            client: reqwest::Client::new(),
            shutdown,
        })
    }

    pub fn url(&self, path: &str, pairs: &[(&str, &str)]) -> String {
        let query: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("http://{}{}?{}", self.addr, path, query.join("&"))
    }

    pub async fn get(&self, path: &str, pairs: &[(&str, &str)]) -> Result<(u16, String)> {
        let response = self
            .client
            .get(self.url(path, pairs))
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;
        let status = response.status().as_u16();
        Ok((status, response.text().await?))
    }

    pub async fn post(&self, path: &str, pairs: &[(&str, &str)], body: &str) -> Result<(u16, String)> {
        let response = self
            .client
            .post(self.url(path, pairs))
            .body(body.to_string())
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;
        let status = response.status().as_u16();
        Ok((status, response.text().await?))
    }

    /// Wait until `n` session records have been emitted.
    pub async fn wait_for_sessions(&self, n: usize, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.sink.sessions().len() < n {
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "expected {n} session records, saw {}",
                    self.sink.sessions().len()
                );
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    pub fn fragment_count(&self) -> usize {
        self.store
            .keys(waypost_core::session::FRAGMENT_PREFIX)
            .map(|k| k.len())
            .unwrap_or(0)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// The fields every request carries.
pub fn common<'a>(extra: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
    let mut pairs = vec![
        ("propagation_channel_id", "cafe"),
        ("sponsor_id", "beef"),
        ("client_version", "7"),
        ("server_secret", SECRET),
    ];
    pairs.extend_from_slice(extra);
    pairs
}
