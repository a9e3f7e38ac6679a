//! Graceful-shutdown plumbing shared by every adapter.
//!
//! Shutdown sequence: flip the watch flag (accept loops exit), cancel the
//! adapter's root token (every in-flight context is a child of it), then
//! wait for the connection count to drain up to a deadline before
//! force-closing.

use sb_core::CancelToken;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// Counts live connections / in-flight sessions for drain tracking.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    count: Arc<AtomicUsize>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(&self) -> ConnectionGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            count: self.count.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until the count hits zero or `deadline` passes.  Returns true on
    /// a clean drain.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let started = std::time::Instant::now();
        while self.active() > 0 {
            if started.elapsed() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

pub struct ConnectionGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One shutdown handle per adapter: accept-loop flag + root cancellation.
pub struct Shutdown {
    stop_tx: watch::Sender<bool>,
    root: CancelToken,
    tracker: ConnectionTracker,
}

impl Shutdown {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Shutdown {
            stop_tx,
            root: CancelToken::new(),
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// The adapter-level token; per-connection and per-request tokens derive
    /// from it so one cancel reaches everything in flight.
    pub fn root_token(&self) -> CancelToken {
        self.root.clone()
    }

    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Stop accepting, signal in-flight work, wait for drain, force-close.
    /// Returns true if everything drained before the deadline.
    pub async fn shutdown(&self, drain_deadline: Duration) -> bool {
        let _ = self.stop_tx.send(true);
        self.root.cancel();
        self.tracker.drain(drain_deadline).await
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
