//! waypost-services: session tracking, key rotation, and the collaborators
//! the HTTP handlers call into.

pub mod auth;
pub mod catalog;
pub mod expiry;
pub mod geo;
pub mod peer;
pub mod psk;
pub mod sink;
pub mod sqlite_store;
pub mod store;
pub mod tracker;

pub use auth::{AuthError, AuthOutcome, CredentialVerifier, DigestCredentialVerifier, SessionAuthenticator};
pub use catalog::HandshakeCatalog;
pub use expiry::{expiry_timer, ExpiryEvents, ExpiryTimer};
pub use geo::{PrefixRegionTable, RegionLookup, SessionGeo};
pub use peer::{Discovery, PeerDirectory, PeerServer};
pub use psk::{LogPskSink, PskError, PskRotator, PskSink, PskState, SecretsFileSink};
pub use sink::{EventSink, FanoutSink, JsonLinesSink, LogSink, MemorySink, RequestSummary, StatsEvent};
pub use sqlite_store::SqliteFragmentStore;
pub use store::{FragmentStore, MemoryFragmentStore, StoreError};
pub use tracker::{ConnectRecord, SessionTracker, TrackerError, TrackerSettings, UpdateOutcome};
