//! Stats event sinks.
//!
//! Every accepted request and every flushed session produces one
//! `StatsEvent`. Sinks are fire-and-forget: a sink that cannot write logs
//! the failure and drops the event, it never fails the request.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use waypost_core::session::SessionRecord;
use waypost_core::validate::RelayProtocol;

/// Fields shared by every request-derived event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestSummary {
    /// This server's network address.
    pub server: String,
    pub region: String,
    pub propagation_channel_id: String,
    pub sponsor_id: String,
    pub client_version: u32,
    pub relay_protocol: RelayProtocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatsEvent {
    Handshake {
        #[serde(flatten)]
        request: RequestSummary,
        psk_sequence: u64,
    },
    Connected {
        #[serde(flatten)]
        request: RequestSummary,
        /// Session id, or the tunnel address for clients that predate ids.
        session: String,
    },
    Failed {
        #[serde(flatten)]
        request: RequestSummary,
        error_code: u32,
    },
    Status {
        #[serde(flatten)]
        request: RequestSummary,
        session: String,
        connected: bool,
        bytes_transferred: u64,
        page_views: u64,
        https_requests: u64,
    },
    Discovery {
        #[serde(flatten)]
        request: RequestSummary,
        discovered_server: Ipv4Addr,
        new: bool,
    },
    Session(SessionRecord),
}

impl StatsEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StatsEvent::Handshake { .. } => "handshake",
            StatsEvent::Connected { .. } => "connected",
            StatsEvent::Failed { .. } => "failed",
            StatsEvent::Status { .. } => "status",
            StatsEvent::Discovery { .. } => "discovery",
            StatsEvent::Session(_) => "session",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: StatsEvent);
}

/// Writes events to the tracing log under target `waypost::stats`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: StatsEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(target: "waypost::stats", kind = event.name(), %json),
            Err(e) => tracing::warn!(error = %e, kind = event.name(), "failed to encode stats event"),
        }
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonLinesSink {
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl EventSink for JsonLinesSink {
    fn emit(&self, event: StatsEvent) {
        let mut line = match serde_json::to_vec(&event) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode stats event");
                return;
            }
        };
        line.push(b'\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = file.write_all(&line) {
            tracing::warn!(error = %e, kind = event.name(), "failed to append stats event");
        }
    }
}

/// Keeps events in memory for inspection.
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<StatsEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StatsEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                StatsEvent::Session(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    /// (address, new) for every discovery event, in emission order.
    pub fn discoveries(&self) -> Vec<(Ipv4Addr, bool)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                StatsEvent::Discovery {
                    discovered_server,
                    new,
                    ..
                } => Some((discovered_server, new)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events().iter().filter(|e| e.name() == kind).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: StatsEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Sends each event to every inner sink.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: StatsEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}
