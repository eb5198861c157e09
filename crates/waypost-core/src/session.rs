//! Session accounting types: identifiers, open fragments, finalized records.
//!
//! A fragment is the mutable, in-store accounting unit for one session.
//! It is keyed by `session-fragment:<session_id>`, so at most one fragment
//! per session can be live at a time. Flushing a fragment yields an
//! immutable `SessionRecord`.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::secret::random_hex;
use crate::validate::{is_hex, ValidationError, SESSION_ID};

/// Store key prefix for open fragments.
pub const FRAGMENT_PREFIX: &str = "session-fragment:";

/// Store key prefix for per-session region data written at authentication.
pub const GEO_PREFIX: &str = "session-geo:";

/// Longest session id accepted (64 hex chars = 32 bytes).
pub const MAX_SESSION_ID_LEN: usize = 64;

/// Unix seconds, wall clock.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Opaque per-attempt session token, issued at authentication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        if !is_hex(s) || s.len() > MAX_SESSION_ID_LEN {
            return Err(ValidationError::Invalid(SESSION_ID));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn fragment_key(&self) -> String {
        format!("{FRAGMENT_PREFIX}{}", self.0)
    }

    pub fn geo_key(&self) -> String {
        format!("{GEO_PREFIX}{}", self.0)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Open accounting record for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub session_id: SessionId,
    /// Random tag distinguishing successive fragments of the same session.
    pub fragment_id: String,
    /// Unix seconds of the event that opened this fragment.
    pub start_time: u64,
    /// Unix seconds of the latest event folded in.
    pub end_time: u64,
    pub bytes_transferred: u64,
    /// Opened from a status/disconnect with no matching connect.
    #[serde(default)]
    pub partial: bool,
    /// Highest delta sequence number applied, when clients send one.
    #[serde(default)]
    pub last_seq: Option<u64>,
    /// Descriptive fields copied from the connect event.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Unix seconds at which the fragment is due to be flushed. Every
    /// update moves it, in the same store write as the update itself.
    #[serde(default)]
    pub expires_at: u64,
}

impl Fragment {
    pub fn open(session_id: SessionId, fields: BTreeMap<String, String>, now: u64) -> Self {
        Self {
            session_id,
            fragment_id: random_hex(8),
            start_time: now,
            end_time: now,
            bytes_transferred: 0,
            partial: false,
            last_seq: None,
            fields,
            expires_at: now,
        }
    }

    /// A fragment for an update that arrived without a known connect.
    pub fn open_partial(session_id: SessionId, now: u64, bytes: u64, seq: Option<u64>) -> Self {
        let mut fragment = Self::open(session_id, BTreeMap::new(), now);
        fragment.partial = true;
        fragment.bytes_transferred = bytes;
        fragment.last_seq = seq;
        fragment
    }

    /// Whether a delta with this sequence number has not been applied yet.
    /// Unsequenced deltas are always applied.
    pub fn accepts(&self, seq: Option<u64>) -> bool {
        match (seq, self.last_seq) {
            (Some(s), Some(last)) => s > last,
            _ => true,
        }
    }

    /// Fold in one update. `end_time` never moves backwards.
    pub fn apply(&mut self, now: u64, bytes: u64, seq: Option<u64>) {
        self.end_time = self.end_time.max(now);
        self.bytes_transferred = self.bytes_transferred.saturating_add(bytes);
        if seq.is_some() {
            self.last_seq = seq.max(self.last_seq);
        }
    }

    /// Push the flush deadline to `now + ttl_secs`.
    pub fn extend(&mut self, now: u64, ttl_secs: u64) {
        self.expires_at = now.saturating_add(ttl_secs);
    }

    pub fn is_due(&self, now: u64) -> bool {
        self.expires_at <= now
    }

    pub fn finalize(self) -> SessionRecord {
        SessionRecord {
            duration_secs: self.end_time.saturating_sub(self.start_time),
            session_id: self.session_id,
            fragment_id: self.fragment_id,
            start_time: self.start_time,
            end_time: self.end_time,
            bytes_transferred: self.bytes_transferred,
            partial: self.partial,
            fields: self.fields,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A completed session, emitted once when its fragment is flushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub fragment_id: String,
    pub start_time: u64,
    pub end_time: u64,
    pub duration_secs: u64,
    pub bytes_transferred: u64,
    pub partial: bool,
    pub fields: BTreeMap<String, String>,
}
