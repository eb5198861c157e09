//! Rotating pre-shared key for the tunnel transport.
//!
//! Every successful handshake rotates the key and hands the new one to the
//! client. Readers take an `Arc` snapshot and never block a rotation for
//! longer than a pointer swap. Rotations are serialized by a writer lock
//! so sequence numbers are strictly increasing and each one corresponds to
//! exactly one key that was pushed to the transport.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use thiserror::Error;
use waypost_core::secret::Psk;

#[derive(Debug, Error)]
pub enum PskError {
    #[error("failed to write secrets file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("psk sink rejected key: {0}")]
    Rejected(String),
}

/// One published key.
#[derive(Debug)]
pub struct PskState {
    /// 0 for the boot key, which is never handed to a client.
    pub sequence: u64,
    /// Address the key is scoped to.
    pub server: String,
    pub psk: Psk,
}

/// Where a new key goes before clients may see it.
pub trait PskSink: Send + Sync {
    fn push(&self, state: &PskState) -> Result<(), PskError>;
}

/// Logs the fingerprint of each key. For deployments where the transport
/// reads keys some other way, and for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPskSink;

impl PskSink for LogPskSink {
    fn push(&self, state: &PskState) -> Result<(), PskError> {
        tracing::info!(
            server = %state.server,
            sequence = state.sequence,
            fingerprint = %state.psk.fingerprint(),
            "psk rotated"
        );
        Ok(())
    }
}

/// Rewrites the transport's secrets file with the current key.
///
/// The file is replaced through a temp file and a rename, so the transport
/// never reads a half-written line.
pub struct SecretsFileSink {
    path: PathBuf,
}

impl SecretsFileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn line(state: &PskState) -> String {
        format!("{} %any : PSK \"{}\"\n", state.server, state.psk.as_str())
    }
}

impl PskSink for SecretsFileSink {
    fn push(&self, state: &PskState) -> Result<(), PskError> {
        let err = |source| PskError::Write {
            path: self.path.clone(),
            source,
        };
        let tmp = self.path.with_extension("tmp");

        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp).map_err(err)?;
        file.write_all(Self::line(state).as_bytes()).map_err(err)?;
        file.sync_all().map_err(err)?;
        fs::rename(&tmp, &self.path).map_err(err)?;

        tracing::debug!(
            path = %self.path.display(),
            sequence = state.sequence,
            fingerprint = %state.psk.fingerprint(),
            "secrets file updated"
        );
        Ok(())
    }
}

pub struct PskRotator {
    current: RwLock<Arc<PskState>>,
    writer: Mutex<()>,
    sink: Arc<dyn PskSink>,
    length_bytes: usize,
}

impl PskRotator {
    pub fn new(server: impl Into<String>, length_bytes: usize, sink: Arc<dyn PskSink>) -> Self {
        let boot = PskState {
            sequence: 0,
            server: server.into(),
            psk: Psk::generate(length_bytes),
        };
        Self {
            current: RwLock::new(Arc::new(boot)),
            writer: Mutex::new(()),
            sink,
            length_bytes,
        }
    }

    /// The key clients were most recently given.
    pub fn snapshot(&self) -> Arc<PskState> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Generate a key, push it to the sink, then publish it.
    ///
    /// If the push fails the previous key stays current and the sequence
    /// does not advance.
    pub fn rotate(&self) -> Result<Arc<PskState>, PskError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.snapshot();
        let next = Arc::new(PskState {
            sequence: previous.sequence + 1,
            server: previous.server.clone(),
            psk: Psk::generate(self.length_bytes),
        });

        self.sink.push(&next).inspect_err(|e| {
            tracing::warn!(sequence = next.sequence, error = %e, "psk push failed, keeping previous key");
        })?;

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        Ok(next)
    }
}
