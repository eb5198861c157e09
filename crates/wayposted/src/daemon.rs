//! `serve` mode: wire the collaborators together and run until ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use waypost_api::ApiState;
use waypost_core::config::{StoreBackend, WaypostConfig};
use waypost_core::session::now_secs;
use waypost_services::{
    expiry_timer, EventSink, FanoutSink, FragmentStore, HandshakeCatalog, JsonLinesSink, LogPskSink,
    LogSink, MemoryFragmentStore, PeerDirectory, PrefixRegionTable, PskRotator, PskSink,
    SecretsFileSink, SessionGeo, SessionTracker, SqliteFragmentStore, TrackerSettings,
};

pub fn open_store(config: &WaypostConfig) -> Result<Arc<dyn FragmentStore>> {
    Ok(match config.sessions.store {
        StoreBackend::Memory => Arc::new(MemoryFragmentStore::new()),
        StoreBackend::Sqlite => Arc::new(
            SqliteFragmentStore::open(&config.sessions.sqlite_path)
                .context("failed to open fragment store")?,
        ),
    })
}

fn stats_sink(config: &WaypostConfig) -> Result<Arc<dyn EventSink>> {
    let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(LogSink)];
    if let Some(path) = &config.stats.records_path {
        let file = JsonLinesSink::open(path)
            .with_context(|| format!("failed to open stats file {}", path.display()))?;
        tracing::info!(path = %path.display(), "writing stats records");
        sinks.push(Arc::new(file));
    }
    Ok(Arc::new(FanoutSink::new(sinks)))
}

fn psk_sink(secrets_path: Option<&PathBuf>) -> Arc<dyn PskSink> {
    match secrets_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "psk rotations go to secrets file");
            Arc::new(SecretsFileSink::new(path.clone()))
        }
        None => {
            tracing::warn!("no psk secrets file configured, rotations are only logged");
            Arc::new(LogPskSink)
        }
    }
}

pub async fn run(config: WaypostConfig) -> Result<()> {
    if config.server.web_server_secret.is_empty() {
        anyhow::bail!("server.web_server_secret is not set");
    }
    tracing::info!(
        listen = %config.server.listen_addr,
        ip_address = %config.server.ip_address,
        store = ?config.sessions.store,
        "wayposted starting"
    );

    let store = open_store(&config)?;
    let sink = stats_sink(&config)?;
    let settings = TrackerSettings::from(&config.sessions);
    let (timer, expiry_events) = expiry_timer();
    let tracker = SessionTracker::new(store.clone(), timer.clone(), sink.clone(), settings);
    let geo = SessionGeo::new(store.clone(), timer.clone(), settings.geo_ttl);

    let recovered = tracker
        .recover(now_secs())
        .context("failed to scan fragment store")?;
    tracing::info!(recovered, "expiry deadlines armed");

    let peers = PeerDirectory::from_config(&config.discovery.servers);
    let catalog = HandshakeCatalog::from_config(&config.sponsors, &config.upgrades);
    tracing::info!(
        peers = peers.servers().len(),
        sponsors = config.sponsors.len(),
        "handshake catalog loaded"
    );

    let state = ApiState {
        server_address: Arc::from(config.server.ip_address.as_str()),
        web_server_secret: Arc::from(config.server.web_server_secret.as_str()),
        catalog: Arc::new(catalog),
        peers,
        psk: Arc::new(PskRotator::new(
            config.server.ip_address.clone(),
            config.psk.length_bytes,
            psk_sink(config.psk.secrets_path.as_ref()),
        )),
        tracker: tracker.clone(),
        geo: geo.clone(),
        regions: Arc::new(PrefixRegionTable::from_config(&config.geo)),
        sink,
        download_dir: Arc::new(config.download.path.clone()),
    };

    // ── Shutdown ─────────────────────────────────────────────────────────────

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("ctrl-c received");
            let _ = shutdown.send(());
        });
    }

    // ── Background tasks ─────────────────────────────────────────────────────

    let expiry_task = tokio::spawn(timer.run(
        Duration::from_millis(config.sessions.sweep_interval_ms),
        shutdown_tx.subscribe(),
    ));
    let flush_task = tokio::spawn(tracker.run_flush_listener(expiry_events, shutdown_tx.subscribe()));

    let geo_purge_task = {
        let mut shutdown = shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(settings.geo_ttl);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => match geo.purge_expired(now_secs()) {
                        Ok(0) => {}
                        Ok(purged) => tracing::debug!(purged, "expired geo entries removed"),
                        Err(e) => tracing::warn!(error = %e, "geo purge failed"),
                    },
                    _ = shutdown.recv() => break,
                }
            }
        })
    };

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    let server_task = tokio::spawn(waypost_api::serve(
        state,
        listener,
        config.server.max_body_bytes,
        shutdown_tx.subscribe(),
    ));

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = server_task         => tracing::error!("web server exited: {:?}", r),
        r = expiry_task         => tracing::error!("expiry task exited: {:?}", r),
        r = flush_task          => tracing::error!("flush listener exited: {:?}", r),
        r = geo_purge_task      => tracing::error!("geo purge exited: {:?}", r),
    }

    Ok(())
}
