use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::aio::ConnectionManager;

use crate::errors::AppError;

const CLEANUP_EVERY_CALLS: u64 = 512;

/// Fixed-window call budget keyed by service name.
///
/// Windows are aligned to wall-clock time (`now / window`), so an idle service
/// starts each window with a fresh budget and never accumulates unused calls.
/// Counters are either in-process (per-key `DashMap` shard lock) or shared in
/// Redis via an atomic INCR + EXPIRE script.
#[derive(Clone)]
pub struct RateLimiter {
    window: Duration,
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Local {
        windows: Arc<DashMap<String, WindowState>>,
        calls_seen: Arc<AtomicU64>,
    },
    Redis(ConnectionManager),
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    index: u64,
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

/// Index of the window containing `now`, and the time left until it closes.
fn window_position(now: DateTime<Utc>, window: Duration) -> (u64, Duration) {
    let window_ms = window.as_millis().max(1) as u64;
    let now_ms = now.timestamp_millis().max(0) as u64;
    let index = now_ms / window_ms;
    let remaining = window_ms - now_ms % window_ms;
    (index, Duration::from_millis(remaining))
}

impl RateLimiter {
    pub fn local(window: Duration) -> Self {
        Self {
            window,
            backend: Backend::Local {
                windows: Arc::new(DashMap::new()),
                calls_seen: Arc::new(AtomicU64::new(0)),
            },
        }
    }

    pub fn redis(conn: ConnectionManager, window: Duration) -> Self {
        Self {
            window,
            backend: Backend::Redis(conn),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn try_acquire(&self, service: &str, limit: u32) -> Result<RateDecision, AppError> {
        self.try_acquire_at(service, limit, Utc::now()).await
    }

    /// Take one call from `service`'s budget for the window containing `now`.
    /// A call is allowed iff fewer than `limit` calls were already taken.
    pub async fn try_acquire_at(
        &self,
        service: &str,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, AppError> {
        let (index, remaining) = window_position(now, self.window);

        let allowed = match &self.backend {
            Backend::Local {
                windows,
                calls_seen,
            } => {
                let allowed = {
                    let mut state = windows
                        .entry(service.to_string())
                        .or_insert(WindowState { index, count: 0 });
                    if state.index != index {
                        *state = WindowState { index, count: 0 };
                    }
                    if state.count < limit {
                        state.count += 1;
                        true
                    } else {
                        false
                    }
                };
                if calls_seen.fetch_add(1, Ordering::Relaxed) % CLEANUP_EVERY_CALLS == 0 {
                    windows.retain(|_, w| w.index >= index);
                }
                allowed
            }
            Backend::Redis(conn) => {
                let key = format!("rate:{}:{}", service, index);
                let count = increment(conn, &key, self.window).await?;
                count <= u64::from(limit)
            }
        };

        if allowed {
            Ok(RateDecision::Allowed)
        } else {
            tracing::warn!(
                rate_limit = true,
                service,
                limit,
                retry_after_ms = remaining.as_millis() as u64,
                "rate limit exceeded"
            );
            Ok(RateDecision::Limited {
                retry_after: remaining,
            })
        }
    }
}

async fn increment(conn: &ConnectionManager, key: &str, window: Duration) -> Result<u64, AppError> {
    let mut conn = conn.clone();
    let ttl_secs = window.as_secs().max(1) + 1;
    // Atomic INCR + EXPIRE
    let script = redis::Script::new(
        r#"
        local current = redis.call("INCR", KEYS[1])
        if current == 1 then
            redis.call("EXPIRE", KEYS[1], ARGV[1])
        end
        return current
    "#,
    );
    let count: u64 = script
        .key(key)
        .arg(ttl_secs)
        .invoke_async(&mut conn)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64, millis: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, millis * 1_000_000).unwrap()
    }

    #[test]
    fn test_window_position_aligned_to_wall_clock() {
        let w = Duration::from_secs(60);
        assert_eq!(window_position(at(120, 0), w), (2, Duration::from_secs(60)));
        assert_eq!(window_position(at(179, 500), w), (2, Duration::from_millis(500)));
        assert_eq!(window_position(at(180, 0), w).0, 3);
    }

    #[tokio::test]
    async fn test_n_plus_one_call_is_limited() {
        let limiter = RateLimiter::local(Duration::from_secs(60));
        let now = at(600, 0);
        for _ in 0..3 {
            assert_eq!(
                limiter.try_acquire_at("svc", 3, now).await.unwrap(),
                RateDecision::Allowed
            );
        }
        assert_eq!(
            limiter
                .try_acquire_at("svc", 3, at(610, 0))
                .await
                .unwrap(),
            RateDecision::Limited {
                retry_after: Duration::from_secs(50)
            }
        );
    }

    #[tokio::test]
    async fn test_budget_resets_at_window_boundary() {
        let limiter = RateLimiter::local(Duration::from_secs(60));
        assert_eq!(limiter.try_acquire_at("svc", 1, at(60, 0)).await.unwrap(), RateDecision::Allowed);
        assert!(matches!(
            limiter.try_acquire_at("svc", 1, at(119, 999)).await.unwrap(),
            RateDecision::Limited { .. }
        ));
        assert_eq!(limiter.try_acquire_at("svc", 1, at(120, 0)).await.unwrap(), RateDecision::Allowed);
    }

    #[tokio::test]
    async fn test_idle_windows_do_not_accumulate_budget() {
        let limiter = RateLimiter::local(Duration::from_secs(60));
        limiter.try_acquire_at("svc", 2, at(0, 0)).await.unwrap();
        // Ten idle windows later the budget is still exactly 2.
        let later = at(600, 0);
        assert_eq!(limiter.try_acquire_at("svc", 2, later).await.unwrap(), RateDecision::Allowed);
        assert_eq!(limiter.try_acquire_at("svc", 2, later).await.unwrap(), RateDecision::Allowed);
        assert!(matches!(
            limiter.try_acquire_at("svc", 2, later).await.unwrap(),
            RateDecision::Limited { .. }
        ));
    }

    #[tokio::test]
    async fn test_services_have_independent_budgets() {
        let limiter = RateLimiter::local(Duration::from_secs(60));
        let now = at(60, 0);
        assert_eq!(limiter.try_acquire_at("a", 1, now).await.unwrap(), RateDecision::Allowed);
        assert_eq!(limiter.try_acquire_at("b", 1, now).await.unwrap(), RateDecision::Allowed);
    }

    #[tokio::test]
    async fn test_concurrent_callers_never_exceed_limit() {
        let limiter = RateLimiter::local(Duration::from_secs(3600));
        let now = at(3600, 0);
        let mut handles = Vec::new();
        for _ in 0..64 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.try_acquire_at("shared", 10, now).await.unwrap()
            }));
        }
        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap() == RateDecision::Allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }
}
