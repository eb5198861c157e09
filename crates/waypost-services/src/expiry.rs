//! Expiry timer: local wake-ups for store keys.
//!
//! The authoritative deadline of a key is stored with its value. This timer
//! only tells the owning process when to go and check it. It holds one
//! deadline per key and, once a deadline passes, removes it and sends the
//! key on a channel. There is exactly one receiver, so every armed deadline
//! is announced at most once and keys arrive in deadline order within a
//! sweep.
//!
//! Re-arming a key replaces its deadline. A wake-up for a key that turns
//! out not to be due yet is answered by arming it again.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

/// Sender side: arm, refresh, and sweep deadlines. Cheap to clone.
#[derive(Clone)]
pub struct ExpiryTimer {
    deadlines: Arc<DashMap<String, Instant>>,
    tx: mpsc::UnboundedSender<String>,
}

/// Receiver side: keys whose deadline has passed.
pub struct ExpiryEvents {
    rx: mpsc::UnboundedReceiver<String>,
}

impl ExpiryEvents {
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

/// Create a timer and the single stream of its expiry notifications.
pub fn expiry_timer() -> (ExpiryTimer, ExpiryEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ExpiryTimer {
            deadlines: Arc::new(DashMap::new()),
            tx,
        },
        ExpiryEvents { rx },
    )
}

impl ExpiryTimer {
    /// Set or refresh the deadline for `key` to now + `ttl`.
    pub fn arm(&self, key: &str, ttl: Duration) {
        self.deadlines.insert(key.to_string(), Instant::now() + ttl);
    }

    pub fn disarm(&self, key: &str) -> bool {
        self.deadlines.remove(key).is_some()
    }

    pub fn pending(&self) -> usize {
        self.deadlines.len()
    }

    /// Remove every due deadline and announce its key. Returns how many fired.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut due: Vec<(Instant, String)> = Vec::new();
        self.deadlines.retain(|key, deadline| {
            if *deadline <= now {
                due.push((*deadline, key.clone()));
                false
            } else {
                true
            }
        });
        due.sort();

        let fired = due.len();
        for (_, key) in due {
            if self.tx.send(key).is_err() {
                tracing::warn!("expiry receiver dropped, notification lost");
            }
        }
        fired
    }

    /// Sweep on a fixed interval until shutdown.
    pub async fn run(self, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        tracing::info!(interval_ms = interval.as_millis() as u64, "expiry timer starting");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let fired = self.sweep();
                    if fired > 0 {
                        tracing::debug!(fired, pending = self.pending(), "expiry sweep");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!(pending = self.pending(), "expiry timer stopping");
                    break;
                }
            }
        }
    }
}
