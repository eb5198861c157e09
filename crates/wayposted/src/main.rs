//! wayposted: waypost web front-end daemon.
//!
//!   wayposted [serve]   run the client-facing HTTP service
//!   wayposted pam-auth  check one tunnel login (called by the SSH auth hook)

use anyhow::Result;

use waypost_core::config::WaypostConfig;

mod daemon;
mod pam_auth;

fn load_config() -> WaypostConfig {
    if let Err(e) = WaypostConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    WaypostConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        WaypostConfig::default()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let mode = std::env::args().nth(1).unwrap_or_else(|| "serve".to_string());

    // stdout belongs to the auth hook in pam-auth mode.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match mode.as_str() {
        "serve" => daemon::run(load_config()).await,
        "pam-auth" => {
            let code = pam_auth::run(&load_config()).await;
            std::process::exit(code);
        }
        other => anyhow::bail!("unknown mode {other:?}, expected serve or pam-auth"),
    }
}
