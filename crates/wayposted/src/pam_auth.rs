//! `pam-auth` mode: one tunnel login, exit status is the verdict.
//!
//! The SSH server's auth hook passes the user and remote host in
//! `PAM_USER` / `PAM_RHOST` and the authtok on stdin. The session region
//! is written to the shared fragment store for the daemon to pick up, so
//! this only works across processes with the sqlite backend.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use waypost_core::config::{StoreBackend, WaypostConfig};
use waypost_core::session::now_secs;
use waypost_services::{
    expiry_timer, DigestCredentialVerifier, PrefixRegionTable, SessionAuthenticator, SessionGeo,
    TrackerSettings,
};

use crate::daemon::open_store;

pub async fn run(config: &WaypostConfig) -> i32 {
    match authenticate(config).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::info!(error = %e, "tunnel login refused");
            1
        }
    }
}

async fn authenticate(config: &WaypostConfig) -> Result<()> {
    let user = std::env::var("PAM_USER").context("PAM_USER not set")?;
    let remote_ip = std::env::var("PAM_RHOST")
        .ok()
        .and_then(|h| h.parse::<IpAddr>().ok());

    let mut authtok = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut authtok)
        .await
        .context("failed to read authtok")?;

    if config.sessions.store == StoreBackend::Memory {
        tracing::warn!("memory store configured, session region will not reach the daemon");
    }
    let store = open_store(config)?;
    // Deadlines are the daemon's job; this process exits right away.
    let (timer, _events) = expiry_timer();
    let settings = TrackerSettings::from(&config.sessions);

    let authenticator = SessionAuthenticator::new(
        &config.auth,
        Arc::new(DigestCredentialVerifier::from_config(&config.auth)),
        Arc::new(PrefixRegionTable::from_config(&config.geo)),
        SessionGeo::new(store, timer, settings.geo_ttl),
    );
    authenticator.authenticate(&user, &authtok, remote_ip, now_secs())?;
    Ok(())
}
