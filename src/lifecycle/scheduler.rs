//! Deferred confirmation timers
//!
//! One independently cancellable timer task per delegation, keyed by
//! delegation id. Arming over an outstanding timer replaces it; a publisher
//! confirmation disarms it explicitly; a timer that fires removes its own
//! entry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Schedules the auto-finalize callback for delegations awaiting publisher
/// confirmation
pub struct ConfirmationScheduler {
    /// Grace window the publisher has to confirm
    grace: Duration,
    /// Distinguishes a timer from a re-arm that replaced it
    next_token: AtomicU64,
    /// Outstanding timer per delegation id
    timers: Arc<Mutex<HashMap<String, ArmedTimer>>>,
}

struct ArmedTimer {
    token: u64,
    handle: JoinHandle<()>,
}

impl ConfirmationScheduler {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            next_token: AtomicU64::new(0),
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Arm the timer for a delegation. After the grace window elapses
    /// `on_fire` runs and the entry is dropped; re-arming the same delegation
    /// aborts the previous timer first.
    pub async fn arm<F>(&self, delegation_id: &str, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let grace = self.grace;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let id = delegation_id.to_string();

        let registry = Arc::clone(&self.timers);
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            on_fire.await;
            // Remove our own entry, unless a re-arm already replaced it
            let mut timers = registry.lock().await;
            if timers.get(&task_id).map_or(false, |t| t.token == token) {
                timers.remove(&task_id);
            }
        });

        let mut timers = self.timers.lock().await;
        if let Some(previous) = timers.insert(id, ArmedTimer { token, handle }) {
            previous.handle.abort();
            tracing::warn!(delegation_id, "Replaced an outstanding confirmation timer");
        } else {
            tracing::debug!(delegation_id, "Armed confirmation timer");
        }
    }

    /// Disarm the timer for a delegation; returns whether one was pending
    pub async fn cancel(&self, delegation_id: &str) -> bool {
        let mut timers = self.timers.lock().await;
        match timers.remove(delegation_id) {
            Some(timer) => {
                let was_pending = !timer.handle.is_finished();
                timer.handle.abort();
                tracing::debug!(delegation_id, "Cancelled confirmation timer");
                was_pending
            }
            None => false,
        }
    }

    /// Whether a timer is armed and has not fired yet
    pub async fn is_armed(&self, delegation_id: &str) -> bool {
        let timers = self.timers.lock().await;
        timers
            .get(delegation_id)
            .map_or(false, |t| !t.handle.is_finished())
    }

    /// Number of timer entries currently held
    pub async fn outstanding(&self) -> usize {
        self.timers.lock().await.len()
    }
}
