//! Peer directory: the servers handed out in handshake responses.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use dashmap::DashMap;
use waypost_core::config::ServerEntryConfig;

/// A server clients may connect to next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerServer {
    pub address: Ipv4Addr,
    pub web_server_port: u16,
    pub web_server_secret: String,
    pub certificate: String,
}

impl PeerServer {
    /// The opaque entry a client receives: hex of
    /// `"<ip> <port> <secret> <certificate>"`.
    pub fn encoded(&self) -> String {
        hex::encode(format!(
            "{} {} {} {}",
            self.address, self.web_server_port, self.web_server_secret, self.certificate
        ))
    }
}

/// Whether a handed-out server was already known to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discovery {
    pub address: Ipv4Addr,
    pub new: bool,
}

/// Per-address sighting counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryCounts {
    pub new: u64,
    pub known: u64,
}

/// Deduplicated peer list plus discovery counters.
///
/// The list is fixed at startup. Counters are shared between request
/// tasks.
#[derive(Clone, Default)]
pub struct PeerDirectory {
    servers: Arc<Vec<PeerServer>>,
    counts: Arc<DashMap<Ipv4Addr, DiscoveryCounts>>,
}

impl PeerDirectory {
    /// Build from config. Entries with an unparseable address are skipped,
    /// repeated addresses keep their first entry.
    pub fn from_config(entries: &[ServerEntryConfig]) -> Self {
        let mut seen = HashSet::new();
        let mut servers = Vec::with_capacity(entries.len());
        for entry in entries {
            let address: Ipv4Addr = match entry.ip_address.parse() {
                Ok(a) => a,
                Err(_) => {
                    tracing::warn!(ip_address = %entry.ip_address, "skipping peer with bad address");
                    continue;
                }
            };
            if !seen.insert(address) {
                tracing::debug!(%address, "duplicate peer entry ignored");
                continue;
            }
            servers.push(PeerServer {
                address,
                web_server_port: entry.web_server_port,
                web_server_secret: entry.web_server_secret.clone(),
                certificate: entry.certificate.clone(),
            });
        }
        Self {
            servers: Arc::new(servers),
            counts: Arc::new(DashMap::new()),
        }
    }

    pub fn servers(&self) -> &[PeerServer] {
        &self.servers
    }

    /// One discovery per peer, `new` when the client did not list it.
    pub fn discover(&self, known: &[Ipv4Addr]) -> Vec<Discovery> {
        self.servers
            .iter()
            .map(|s| Discovery {
                address: s.address,
                new: !known.contains(&s.address),
            })
            .collect()
    }

    /// Count discoveries that were actually reported to a client.
    pub fn record(&self, discoveries: &[Discovery]) {
        for d in discoveries {
            let mut counts = self.counts.entry(d.address).or_default();
            if d.new {
                counts.new += 1;
            } else {
                counts.known += 1;
            }
        }
    }

    pub fn counts(&self, address: Ipv4Addr) -> DiscoveryCounts {
        self.counts.get(&address).map(|c| *c).unwrap_or_default()
    }
}
