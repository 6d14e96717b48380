use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::Config;

/// Sliding window in-memory rate limiter (process local).
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    store: Arc<DashMap<String, VecDeque<Instant>>>,
    pub enabled: bool,
}

impl InMemoryRateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self { store: Arc::new(DashMap::new()), enabled }
    }

    /// Returns true and records a hit if allowed, false if limited.
    pub fn check(&self, key: &str, limit: usize, window: Duration) -> bool {
        self.acquire(key, limit, window).is_some()
    }

    /// Like `check`, but hands back the recorded hit so it can be released again.
    /// Disabled limiters grant every request without recording it.
    pub fn acquire(&self, key: &str, limit: usize, window: Duration) -> Option<Instant> {
        let now = Instant::now();
        if !self.enabled {
            return Some(now);
        }
        let mut entry = self.store.entry(key.to_string()).or_default();
        evict(&mut entry, now, window);
        if entry.len() < limit {
            entry.push_back(now);
            Some(now)
        } else {
            None
        }
    }

    /// Forgets a hit returned by `acquire`.
    pub fn release(&self, key: &str, hit: Instant) {
        if let Some(mut entry) = self.store.get_mut(key) {
            if let Some(pos) = entry.iter().rposition(|t| *t == hit) {
                entry.remove(pos);
            }
        }
    }

    /// Drops keys whose hits all fell out of `window`.
    pub fn prune(&self, window: Duration) {
        let now = Instant::now();
        self.store.retain(|_, hits| {
            evict(hits, now, window);
            !hits.is_empty()
        });
    }
}

fn evict(hits: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = hits.front() {
        if now.duration_since(*front) >= window {
            hits.pop_front();
        } else {
            break;
        }
    }
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub thread_cooldown: Duration,
    pub reply_limit: usize,
    pub reply_window: Duration,
}

impl From<&Config> for RateLimitConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            thread_cooldown: cfg.thread_cooldown,
            reply_limit: cfg.reply_limit,
            reply_window: cfg.reply_window,
        }
    }
}

/// Per-IP posting limits used by the post writer.
#[derive(Clone)]
pub struct RateLimiterFacade {
    pub limiter: InMemoryRateLimiter,
    pub cfg: RateLimitConfig,
}

impl RateLimiterFacade {
    pub fn new(limiter: InMemoryRateLimiter, cfg: RateLimitConfig) -> Self {
        Self { limiter, cfg }
    }

    /// Disabled in debug mode.
    pub fn from_config(cfg: &Config) -> Self {
        Self::new(InMemoryRateLimiter::new(!cfg.debug), RateLimitConfig::from(cfg))
    }

    /// Claims the thread-creation slot for `ip`. `None` while a cooldown is running.
    pub fn claim_thread(&self, ip: &str) -> Option<Instant> {
        self.limiter.acquire(&format!("thread:{ip}"), 1, self.cfg.thread_cooldown)
    }

    /// Gives the slot back after a failed creation.
    pub fn release_thread(&self, ip: &str, claim: Instant) {
        self.limiter.release(&format!("thread:{ip}"), claim);
    }

    pub fn allow_reply(&self, ip: &str) -> bool {
        self.limiter.check(&format!("reply:{ip}"), self.cfg.reply_limit, self.cfg.reply_window)
    }

    pub fn prune(&self) {
        let longest = self.cfg.thread_cooldown.max(self.cfg.reply_window);
        self.limiter.prune(longest);
    }
}
