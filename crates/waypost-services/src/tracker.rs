//! Session lifecycle tracker.
//!
//! Turns connect / status / disconnect events plus expiry wake-ups into
//! finalized session records. All state lives in the fragment store,
//! keyed by session id, so any front-end instance sharing the store can
//! handle any event.
//!
//! Per session:
//!   absent --connect--> open
//!   open   --connect--> (flush previous) open
//!   open   --status---> open, deadline refreshed
//!   open   --disconnect-> open, deadline collapsed
//!   open   --deadline passed--> flushed, absent
//!
//! Each fragment carries its own `expires_at`, written in the same atomic
//! update as the event that moved it. A flush removes the fragment only if
//! that stored deadline has passed, in one `remove_if`. The local
//! `ExpiryTimer` just says when to look; a wake-up that finds the deadline
//! moved (by a refresh here or on another instance) re-arms for the rest.
//!
//! Disconnect never flushes directly. Only the expiry listener flushes,
//! so a late status racing a disconnect cannot produce two records.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;

use waypost_core::config::SessionsConfig;
use waypost_core::session::{
    now_secs, Fragment, SessionId, SessionRecord, FRAGMENT_PREFIX, GEO_PREFIX,
};

use crate::expiry::{ExpiryEvents, ExpiryTimer};
use crate::geo::remaining_secs;
use crate::sink::{EventSink, StatsEvent};
use crate::store::{FragmentStore, StoreError};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("encode fragment: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerSettings {
    /// Idle window for an open fragment.
    pub fragment_ttl: Duration,
    /// What is left of the window after a disconnect.
    pub disconnect_ttl: Duration,
    /// Lifetime of authentication-time region entries.
    pub geo_ttl: Duration,
}

impl From<&SessionsConfig> for TrackerSettings {
    fn from(c: &SessionsConfig) -> Self {
        Self {
            fragment_ttl: Duration::from_secs(c.fragment_ttl_secs),
            disconnect_ttl: Duration::from_secs(c.disconnect_ttl_secs),
            geo_ttl: Duration::from_secs(c.geo_ttl_secs),
        }
    }
}

/// The fields a connect event seeds a fragment with.
#[derive(Debug, Clone)]
pub struct ConnectRecord {
    pub session_id: SessionId,
    pub fields: BTreeMap<String, String>,
}

/// What a status or disconnect did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Folded into the open fragment.
    Applied,
    /// No open fragment; a partial one was started from this event.
    OpenedPartial,
    /// Sequence number already applied; nothing changed.
    Duplicate,
}

#[derive(Clone)]
pub struct SessionTracker {
    store: Arc<dyn FragmentStore>,
    timer: ExpiryTimer,
    sink: Arc<dyn EventSink>,
    settings: TrackerSettings,
}

impl SessionTracker {
    pub fn new(
        store: Arc<dyn FragmentStore>,
        timer: ExpiryTimer,
        sink: Arc<dyn EventSink>,
        settings: TrackerSettings,
    ) -> Self {
        Self {
            store,
            timer,
            sink,
            settings,
        }
    }

    /// Open a fragment for `record`. A fragment already open for the same
    /// session is a reconnect: it is finalized, emitted, and returned.
    pub fn on_connect(
        &self,
        record: ConnectRecord,
        now: u64,
    ) -> Result<Option<SessionRecord>, TrackerError> {
        let key = record.session_id.fragment_key();
        let ttl = self.settings.fragment_ttl;
        let mut fragment = Fragment::open(record.session_id.clone(), record.fields, now);
        fragment.extend(now, ttl.as_secs());
        let fresh = fragment.encode()?;

        let mut previous: Option<Vec<u8>> = None;
        self.store.update(&key, &mut |current| {
            previous = current.map(<[u8]>::to_vec);
            Some(fresh.clone())
        })?;
        self.timer.arm(&key, ttl);

        let flushed = previous.and_then(|bytes| self.finalize(&key, &bytes));
        match &flushed {
            Some(r) => tracing::info!(
                session_id = %r.session_id,
                previous_fragment = %r.fragment_id,
                "reconnect, previous fragment flushed"
            ),
            None => tracing::debug!(session_id = %record.session_id, "fragment opened"),
        }
        Ok(flushed)
    }

    /// Add `bytes` and refresh the idle window.
    pub fn on_status(
        &self,
        session_id: &SessionId,
        bytes: u64,
        seq: Option<u64>,
        now: u64,
    ) -> Result<UpdateOutcome, TrackerError> {
        self.apply(session_id, bytes, seq, now, self.settings.fragment_ttl)
    }

    /// Add `bytes` and collapse the window so the fragment flushes soon.
    pub fn on_disconnect(
        &self,
        session_id: &SessionId,
        bytes: u64,
        seq: Option<u64>,
        now: u64,
    ) -> Result<UpdateOutcome, TrackerError> {
        self.apply(session_id, bytes, seq, now, self.settings.disconnect_ttl)
    }

    fn apply(
        &self,
        session_id: &SessionId,
        bytes: u64,
        seq: Option<u64>,
        now: u64,
        ttl: Duration,
    ) -> Result<UpdateOutcome, TrackerError> {
        let key = session_id.fragment_key();
        let mut outcome = UpdateOutcome::Applied;
        let mut encode_error = None;

        self.store.update(&key, &mut |current| {
            let existing = match current.map(Fragment::decode) {
                Some(Ok(fragment)) => Some(fragment),
                Some(Err(e)) => {
                    tracing::warn!(key = %key, error = %e, "replacing malformed fragment");
                    None
                }
                None => None,
            };
            let mut next = match existing {
                Some(mut fragment) => {
                    if !fragment.accepts(seq) {
                        outcome = UpdateOutcome::Duplicate;
                        return None;
                    }
                    fragment.apply(now, bytes, seq);
                    outcome = UpdateOutcome::Applied;
                    fragment
                }
                None => {
                    outcome = UpdateOutcome::OpenedPartial;
                    Fragment::open_partial(session_id.clone(), now, bytes, seq)
                }
            };
            next.extend(now, ttl.as_secs());
            match next.encode() {
                Ok(encoded) => Some(encoded),
                Err(e) => {
                    encode_error = Some(e);
                    None
                }
            }
        })?;
        if let Some(e) = encode_error {
            return Err(e.into());
        }

        if outcome != UpdateOutcome::Duplicate {
            self.timer.arm(&key, ttl);
        }
        match outcome {
            UpdateOutcome::OpenedPartial => tracing::info!(
                session_id = %session_id,
                "no open fragment, started partial fragment"
            ),
            UpdateOutcome::Duplicate => tracing::debug!(
                session_id = %session_id,
                seq,
                "duplicate delta ignored"
            ),
            UpdateOutcome::Applied => {}
        }
        Ok(outcome)
    }

    /// Handle one expiry wake-up for `key` at unix time `now`.
    pub fn handle_expiry(&self, key: &str, now: u64) -> Result<Option<SessionRecord>, TrackerError> {
        if key.starts_with(FRAGMENT_PREFIX) {
            self.flush_if_due(key, now)
        } else if key.starts_with(GEO_PREFIX) {
            let mut left = None;
            self.store.remove_if(key, &mut |bytes| {
                left = remaining_secs(bytes, now);
                left.is_none()
            })?;
            if let Some(secs) = left {
                self.timer.arm(key, Duration::from_secs(secs));
            }
            Ok(None)
        } else {
            tracing::warn!(key, "ignoring expiry for unknown key");
            Ok(None)
        }
    }

    /// The one consumer of expiry notifications. Runs until shutdown.
    pub async fn run_flush_listener(
        self,
        mut events: ExpiryEvents,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        tracing::info!("flush listener starting");
        loop {
            tokio::select! {
                key = events.recv() => match key {
                    Some(key) => {
                        if let Err(e) = self.handle_expiry(&key, now_secs()) {
                            tracing::error!(key = %key, error = %e, "flush failed");
                        }
                    }
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("flush listener stopped");
    }

    /// Arm a local wake-up for everything already in the store, at its
    /// stored deadline, e.g. after a restart on a durable store. Entries
    /// that cannot be decoded wake up at once and are discarded. Returns
    /// how many keys were armed.
    pub fn recover(&self, now: u64) -> Result<usize, TrackerError> {
        let fragments = self.store.keys(FRAGMENT_PREFIX)?;
        let geo_keys = self.store.keys(GEO_PREFIX)?;
        for key in &fragments {
            let left = self
                .store
                .get(key)?
                .and_then(|bytes| Fragment::decode(&bytes).ok())
                .map(|f| f.expires_at.saturating_sub(now))
                .unwrap_or(0);
            self.timer.arm(key, Duration::from_secs(left));
        }
        for key in &geo_keys {
            let left = self
                .store
                .get(key)?
                .and_then(|bytes| remaining_secs(&bytes, now))
                .unwrap_or(0);
            self.timer.arm(key, Duration::from_secs(left));
        }
        if !fragments.is_empty() || !geo_keys.is_empty() {
            tracing::info!(
                fragments = fragments.len(),
                geo = geo_keys.len(),
                "re-armed expiry for stored sessions"
            );
        }
        Ok(fragments.len() + geo_keys.len())
    }

    /// Remove the fragment at `key` if its stored deadline has passed, and
    /// emit its record. Malformed fragments are always removed.
    fn flush_if_due(&self, key: &str, now: u64) -> Result<Option<SessionRecord>, TrackerError> {
        let mut left = None;
        let taken = self.store.remove_if(key, &mut |bytes| match Fragment::decode(bytes) {
            Ok(fragment) if !fragment.is_due(now) => {
                left = Some(fragment.expires_at - now);
                false
            }
            _ => true,
        })?;
        if let Some(secs) = left {
            tracing::debug!(key, remaining_secs = secs, "deadline moved, wake-up re-armed");
            self.timer.arm(key, Duration::from_secs(secs));
            return Ok(None);
        }
        match taken {
            Some(bytes) => Ok(self.finalize(key, &bytes)),
            None => {
                tracing::debug!(key, "nothing to flush");
                Ok(None)
            }
        }
    }

    fn finalize(&self, key: &str, bytes: &[u8]) -> Option<SessionRecord> {
        match Fragment::decode(bytes) {
            Ok(fragment) => {
                let record = fragment.finalize();
                tracing::info!(
                    session_id = %record.session_id,
                    fragment_id = %record.fragment_id,
                    duration_secs = record.duration_secs,
                    bytes = record.bytes_transferred,
                    partial = record.partial,
                    "session flushed"
                );
                self.sink.emit(StatsEvent::Session(record.clone()));
                Some(record)
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding malformed fragment");
                None
            }
        }
    }
}
