//! Coordinated shutdown.
//!
//! A [`ShutdownTracker`] owns the cancellation token every long-running
//! component watches, and counts the components that still have to stop.
//! Each component takes a [`StopObligation`] when it starts and confirms it
//! once it has drained. The process exits when the count reaches zero or the
//! grace period runs out.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Obligations {
    pending: Mutex<BTreeMap<u64, String>>,
    next_id: AtomicU64,
    released: Notify,
}

impl Obligations {
    fn release(&self, id: u64) {
        let remaining = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(name) = pending.remove(&id) {
                info!("{} stopped ({} still running)", name, pending.len());
            }
            pending.len()
        };
        if remaining == 0 {
            self.released.notify_waiters();
        }
    }

    fn outstanding(&self) -> Vec<String> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownTracker {
    token: CancellationToken,
    obligations: Arc<Obligations>,
}

impl ShutdownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that is cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested, {} components to stop", self.outstanding().len());
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Record that `name` must confirm before the process may exit.
    pub fn register(&self, name: impl Into<String>) -> StopObligation {
        let name = name.into();
        let id = self.obligations.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("Tracking {} for shutdown", name);
        self.obligations
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, name);
        StopObligation {
            id,
            obligations: self.obligations.clone(),
            confirmed: false,
        }
    }

    /// Names of components that have not confirmed yet.
    pub fn outstanding(&self) -> Vec<String> {
        self.obligations.outstanding()
    }

    /// Wait until every obligation is confirmed. On timeout returns the
    /// components that never confirmed.
    pub async fn wait(&self, grace: Duration) -> std::result::Result<(), Vec<String>> {
        let deadline = Instant::now() + grace;
        loop {
            let released = self.obligations.released.notified();
            if self.obligations.outstanding().is_empty() {
                return Ok(());
            }
            tokio::select! {
                _ = released => {}
                _ = sleep_until(deadline) => {
                    let outstanding = self.obligations.outstanding();
                    if outstanding.is_empty() {
                        return Ok(());
                    }
                    warn!("Shutdown grace period elapsed, still running: {:?}", outstanding);
                    return Err(outstanding);
                }
            }
        }
    }

    /// Trigger shutdown on SIGINT or SIGTERM.
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = wait_for_signal() => tracker.trigger(),
                _ = tracker.token.cancelled() => {}
            }
        })
    }
}

/// A pending stop confirmation. Dropping it confirms as well, so a component
/// that ends by panicking does not hold shutdown up.
#[derive(Debug)]
pub struct StopObligation {
    id: u64,
    obligations: Arc<Obligations>,
    confirmed: bool,
}

impl StopObligation {
    pub fn confirm(mut self) {
        self.confirmed = true;
        self.obligations.release(self.id);
    }
}

impl Drop for StopObligation {
    fn drop(&mut self) {
        if !self.confirmed {
            self.obligations.release(self.id);
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_once_all_confirm() {
        let tracker = ShutdownTracker::new();
        let worker = tracker.register("worker:rss");
        let dashboard = tracker.register("dashboard");
        assert_eq!(tracker.outstanding().len(), 2);

        tracker.trigger();
        assert!(tracker.token().is_cancelled());

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait(Duration::from_secs(5)).await })
        };
        worker.confirm();
        dashboard.confirm();

        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_with_outstanding_names() {
        let tracker = ShutdownTracker::new();
        let _stuck = tracker.register("worker:email");
        let done = tracker.register("worker:rss");
        done.confirm();

        let result = tracker.wait(Duration::from_secs(1)).await;
        assert_eq!(result, Err(vec!["worker:email".to_string()]));
    }

    #[tokio::test]
    async fn test_drop_confirms() {
        let tracker = ShutdownTracker::new();
        {
            let _obligation = tracker.register("dashboard");
        }
        assert!(tracker.outstanding().is_empty());
        assert_eq!(tracker.wait(Duration::from_millis(10)).await, Ok(()));
    }
}
