//! Client-facing request handlers.
//!
//! Every endpoint answers a rejected request the same way: 404 with an
//! empty body. Which check failed is logged, never returned.

pub mod connected;
pub mod download;
pub mod failed;
pub mod handshake;
pub mod status;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use waypost_core::validate::{verify_server_secret, ClientIdentity, RelayProtocol, RequestParams, ValidationError};
use waypost_services::{
    EventSink, HandshakeCatalog, PeerDirectory, PskError, PskRotator, RegionLookup, RequestSummary,
    SessionGeo, SessionTracker, StoreError, TrackerError,
};

#[derive(Clone)]
pub struct ApiState {
    /// This server's public address, reported in every stats event.
    pub server_address: Arc<str>,
    pub web_server_secret: Arc<str>,
    pub catalog: Arc<HandshakeCatalog>,
    pub peers: PeerDirectory,
    pub psk: Arc<PskRotator>,
    pub tracker: SessionTracker,
    pub geo: SessionGeo,
    pub regions: Arc<dyn RegionLookup>,
    pub sink: Arc<dyn EventSink>,
    /// Directory client builds are served from.
    pub download_dir: Arc<PathBuf>,
}

// ── Rejection ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum Rejection {
    Query,
    Invalid(&'static str, ValidationError),
    Tracker(&'static str, TrackerError),
    Store(&'static str, StoreError),
    Psk(PskError),
    Body,
    NotFound,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match &self {
            Rejection::Query => tracing::info!("rejected: unreadable query"),
            Rejection::Invalid(request, e) => {
                tracing::info!(request, field = e.field(), reason = %e, "rejected")
            }
            Rejection::Tracker(request, e) => tracing::warn!(request, error = %e, "rejected: tracker"),
            Rejection::Store(request, e) => tracing::warn!(request, error = %e, "rejected: store"),
            Rejection::Psk(e) => tracing::error!(error = %e, "rejected: psk rotation failed"),
            Rejection::Body => tracing::info!("rejected: unreadable body"),
            Rejection::NotFound => {}
        }
        StatusCode::NOT_FOUND.into_response()
    }
}

impl From<QueryRejection> for Rejection {
    fn from(_: QueryRejection) -> Self {
        Rejection::Query
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

pub type QueryPairs = Result<Query<Vec<(String, String)>>, QueryRejection>;

/// A request whose common fields and secret have been checked.
pub struct Accepted {
    pub request: &'static str,
    pub params: RequestParams,
    pub identity: ClientIdentity,
    pub relay_protocol: RelayProtocol,
}

impl Accepted {
    pub fn invalid(&self, e: ValidationError) -> Rejection {
        Rejection::Invalid(self.request, e)
    }

    pub fn summary(&self, state: &ApiState, region: &str) -> RequestSummary {
        RequestSummary {
            server: state.server_address.to_string(),
            region: region.to_string(),
            propagation_channel_id: self.identity.propagation_channel_id.clone(),
            sponsor_id: self.identity.sponsor_id.clone(),
            client_version: self.identity.client_version,
            relay_protocol: self.relay_protocol,
        }
    }
}

/// Check the secret, then the fields every endpoint shares.
pub fn accept(state: &ApiState, request: &'static str, query: QueryPairs) -> Result<Accepted, Rejection> {
    let Query(pairs) = query?;
    let params = RequestParams::new(pairs);
    let invalid = |e| Rejection::Invalid(request, e);

    verify_server_secret(&params, &state.web_server_secret).map_err(invalid)?;
    let identity = params.client_identity().map_err(invalid)?;
    let relay_protocol = params.relay_protocol().map_err(invalid)?;
    Ok(Accepted {
        request,
        params,
        identity,
        relay_protocol,
    })
}

pub fn client_region(state: &ApiState, client: SocketAddr) -> String {
    state.regions.lookup(client.ip())
}

pub use connected::handle_connected;
pub use download::handle_download;
pub use failed::handle_failed;
pub use handshake::handle_handshake;
pub use status::handle_status;

#[cfg(test)]
pub(crate) mod testing {
    //! State wired to in-memory collaborators.

    use super::*;
    use std::time::Duration;
    use waypost_core::config::{HomePageConfig, ServerEntryConfig, SponsorConfig, UpgradeConfig};
    use waypost_services::{
        expiry_timer, ExpiryEvents, LogPskSink, MemoryFragmentStore, MemorySink, PrefixRegionTable,
        TrackerSettings,
    };

    pub const SECRET: &str = "feedface";

    pub struct Fixture {
        pub state: ApiState,
        pub sink: MemorySink,
        pub store: MemoryFragmentStore,
        pub _events: ExpiryEvents,
    }

    pub fn fixture() -> Fixture {
        let store = MemoryFragmentStore::new();
        let (timer, events) = expiry_timer();
        let sink = MemorySink::new();
        let tracker = SessionTracker::new(
            Arc::new(store.clone()),
            timer.clone(),
            Arc::new(sink.clone()),
            TrackerSettings {
                fragment_ttl: Duration::from_secs(900),
                disconnect_ttl: Duration::from_secs(1),
                geo_ttl: Duration::from_secs(300),
            },
        );
        let catalog = HandshakeCatalog::from_config(
            &[SponsorConfig {
                sponsor_id: "0b".into(),
                home_pages: vec![HomePageConfig { region: "*".into(), url: "https://home.example/".into() }],
            }],
            &[UpgradeConfig { propagation_channel_id: "0a".into(), client_version: 9 }],
        );
        let peers = PeerDirectory::from_config(&[
            ServerEntryConfig {
                ip_address: "192.0.2.10".into(),
                web_server_port: 8080,
                web_server_secret: "aa".into(),
                certificate: "bb".into(),
            },
            ServerEntryConfig {
                ip_address: "192.0.2.11".into(),
                web_server_port: 8080,
                web_server_secret: "cc".into(),
                certificate: "dd".into(),
            },
        ]);
        let state = ApiState {
            server_address: Arc::from("192.0.2.1"),
            web_server_secret: Arc::from(SECRET),
            catalog: Arc::new(catalog),
            peers,
            psk: Arc::new(PskRotator::new("192.0.2.1", 16, Arc::new(LogPskSink))),
            tracker,
            geo: SessionGeo::new(Arc::new(store.clone()), timer, Duration::from_secs(300)),
            regions: Arc::new(PrefixRegionTable::default()),
            sink: Arc::new(sink.clone()),
            download_dir: Arc::new(std::env::temp_dir()),
        };
        Fixture {
            state,
            sink,
            store,
            _events: events,
        }
    }

    pub fn query(pairs: &[(&str, &str)]) -> QueryPairs {
        Ok(Query(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ))
    }

    pub fn client() -> SocketAddr {
        "203.0.113.5:40000".parse().unwrap()
    }
}
