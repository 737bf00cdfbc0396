//! Background job: evict finished and abandoned streaming sessions.

use std::time::Duration;

use tokio::time;

use crate::proxy::session::SessionManager;

/// Spawn the reaper. Runs every `ttl / 4` (at least once a second).
pub fn spawn(sessions: SessionManager, ttl: Duration) {
    tokio::spawn(async move {
        let mut interval = time::interval((ttl / 4).max(Duration::from_secs(1)));
        loop {
            interval.tick().await;
            let evicted = sessions.reap(ttl);
            if evicted > 0 {
                tracing::debug!(evicted, live = sessions.len(), "session reaper pass");
            }
        }
    });
}
