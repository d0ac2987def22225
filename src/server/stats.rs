//! Request accounting for the idle-exit timer.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Counters shared by every request handler.
#[derive(Debug)]
pub struct RequestStats {
    pending: AtomicU64,
    last_request_time: AtomicI64,
    last_activity: Mutex<Instant>,
}

impl Default for RequestStats {
    fn default() -> Self {
        Self {
            pending: AtomicU64::new(0),
            last_request_time: AtomicI64::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }
}

impl RequestStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Requests currently in flight.
    pub fn pending_requests(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wall-clock seconds of the most recent request, 0 if none was seen.
    pub fn last_request_time(&self) -> i64 {
        self.last_request_time.load(Ordering::SeqCst)
    }

    /// Count a request in until the guard drops.
    pub fn begin(self: &Arc<Self>) -> RequestGuard {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.touch();
        RequestGuard {
            stats: Arc::clone(self),
        }
    }

    fn touch(&self) {
        self.last_request_time
            .store(chrono::Utc::now().timestamp(), Ordering::SeqCst);
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    /// Resolve once no request has been pending or started for `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) {
        let mut wait = timeout;
        loop {
            tokio::time::sleep(wait).await;
            let pending = self.pending_requests();
            if pending > 0 {
                debug!(pending, "Requests pending; resetting idle timeout");
                wait = timeout;
                continue;
            }
            let idle = self.idle_for();
            if idle >= timeout {
                return;
            }
            wait = timeout - idle;
        }
    }
}

/// Marks one in-flight request.
#[derive(Debug)]
pub struct RequestGuard {
    stats: Arc<RequestStats>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.stats.pending.fetch_sub(1, Ordering::SeqCst);
        self.stats.touch();
    }
}
