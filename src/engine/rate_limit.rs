//! Per-host rate limiter - FIFO admission within a rolling window
//!
//! Sources declare limits as `"<requests>/<amount><unit>"` (`"1/s"`,
//! `"2/500ms"`). Admission keeps a rolling window of start timestamps per
//! host: at most `requests` admissions within any `period`. Waiters queue
//! FIFO behind a fair async mutex; host state is garbage-collected after
//! five idle minutes.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

static RATE_SPEC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)\s*/\s*(\d+)?(ms|s|m|h)\s*$").unwrap());

const GC_IDLE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests: u32,
    pub period: Duration,
}

impl RateLimit {
    /// Longer period-per-request is the stricter limit.
    fn is_stricter_than(&self, other: &RateLimit) -> bool {
        self.period.as_millis() * other.requests as u128
            > other.period.as_millis() * self.requests as u128
    }
}

/// Parse `"N/Munit"`. The unit is mandatory whenever a numeric period is
/// written: `"2/500"` is invalid, `"1/s"` means one request per second.
pub fn parse_rate_limit(spec: &str) -> Option<RateLimit> {
    let caps = RATE_SPEC.captures(spec)?;
    let requests: u32 = caps[1].parse().ok()?;
    if requests == 0 {
        return None;
    }
    let amount: u64 = caps
        .get(2)
        .map(|m| m.as_str().parse().ok())
        .unwrap_or(Some(1))?;
    if amount == 0 {
        return None;
    }
    let period = match &caps[3] {
        "ms" => Duration::from_millis(amount),
        "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount * 60),
        "h" => Duration::from_secs(amount * 3600),
        _ => return None,
    };
    Some(RateLimit { requests, period })
}

struct HostInner {
    config: Option<RateLimit>,
    timestamps: VecDeque<Instant>,
    last_used: Instant,
}

struct HostState {
    /// Fair mutex: waiters admit in arrival order
    gate: tokio::sync::Mutex<()>,
    inner: Mutex<HostInner>,
}

/// Holding a permit means the request may start. Dropping it refreshes the
/// host's idle clock; the rolling window itself is not affected.
pub struct RatePermit {
    state: Arc<HostState>,
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.state.inner.lock() {
            inner.last_used = Instant::now();
        }
    }
}

#[derive(Default)]
pub struct RateLimiter {
    hosts: Mutex<HashMap<String, Arc<HostState>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for an admission slot on `host`. A `None` config host admits
    /// immediately (still FIFO behind any waiters from a stricter config
    /// seen earlier). Config merges keep the stricter of old and new.
    pub async fn acquire(&self, host: &str, config: Option<RateLimit>) -> RatePermit {
        let state = {
            let mut hosts = self.hosts.lock().unwrap();
            Self::gc(&mut hosts);
            hosts
                .entry(host.to_string())
                .or_insert_with(|| {
                    Arc::new(HostState {
                        gate: tokio::sync::Mutex::new(()),
                        inner: Mutex::new(HostInner {
                            config: None,
                            timestamps: VecDeque::new(),
                            last_used: Instant::now(),
                        }),
                    })
                })
                .clone()
        };

        if let Some(new_cfg) = config {
            let mut inner = state.inner.lock().unwrap();
            match inner.config {
                Some(existing) if !new_cfg.is_stricter_than(&existing) => {}
                _ => inner.config = Some(new_cfg),
            }
        }

        let admission = state.gate.lock().await;
        loop {
            let wait = {
                let mut inner = state.inner.lock().unwrap();
                let now = Instant::now();
                inner.last_used = now;
                match inner.config {
                    None => None,
                    Some(cfg) => {
                        while inner
                            .timestamps
                            .front()
                            .map(|&t| t + cfg.period <= now)
                            .unwrap_or(false)
                        {
                            inner.timestamps.pop_front();
                        }
                        if inner.timestamps.len() < cfg.requests as usize {
                            inner.timestamps.push_back(now);
                            None
                        } else {
                            let front = *inner.timestamps.front().unwrap();
                            Some(front + cfg.period - now)
                        }
                    }
                }
            };
            match wait {
                None => break,
                Some(delay) => {
                    tracing::debug!(host, ?delay, "rate limit wait");
                    tokio::time::sleep(delay).await;
                }
            }
        }
        drop(admission);

        RatePermit { state }
    }

    /// Drop hosts nobody references that have been idle past the GC window.
    fn gc(hosts: &mut HashMap<String, Arc<HostState>>) {
        hosts.retain(|host, state| {
            if Arc::strong_count(state) > 1 {
                return true;
            }
            let Ok(mut inner) = state.inner.try_lock() else {
                return true;
            };
            let now = Instant::now();
            if let Some(cfg) = inner.config {
                while inner
                    .timestamps
                    .front()
                    .map(|&t| t + cfg.period <= now)
                    .unwrap_or(false)
                {
                    inner.timestamps.pop_front();
                }
            }
            let stale = inner.timestamps.is_empty() && inner.last_used.elapsed() >= GC_IDLE;
            if stale {
                tracing::debug!(host, "dropping idle rate-limit state");
            }
            !stale
        });
    }

    #[cfg(test)]
    fn host_count(&self) -> usize {
        self.hosts.lock().unwrap().len()
    }
}
