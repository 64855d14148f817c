//! Per-identity rate limiting with progressive backoff.
//!
//! A short sliding window with a small fixed quota; repeat offenders get an
//! escalating exponential cooldown capped at one hour.  Records expire from
//! the store by TTL, so a quiet identity costs nothing and violations are
//! only forgiven by record expiry, never by a fresh window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::{Gate, GateContext, Rejection};

/// Per-identity request accounting within the current window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub count: u32,
    pub window_start_ms: u64,
    pub violations: u32,
}

impl RateLimitRecord {
    pub fn new(now_ms: u64) -> Self {
        RateLimitRecord {
            count: 0,
            window_start_ms: now_ms,
            violations: 0,
        }
    }
}

/// Quota and backoff knobs.  The defaults are the production values: a
/// 60-second window of 5 requests, dropping to 2 once an identity has
/// accumulated more than 3 violations, with backoff `min(60·2^v, 3600)`.
#[derive(Clone, Copy, Debug)]
pub struct QuotaPolicy {
    pub window_ms: u64,
    pub max_requests: u32,
    pub strike_max_requests: u32,
    pub strike_threshold: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        QuotaPolicy {
            window_ms: 60_000,
            max_requests: 5,
            strike_max_requests: 2,
            strike_threshold: 3,
            backoff_base_secs: 60,
            backoff_cap_secs: 3600,
        }
    }
}

/// Admission decision returned by the store.
#[derive(Clone, Copy, Debug)]
pub struct Admit {
    pub allowed: bool,
    pub retry_after_secs: Option<u64>,
}

/// Window and backoff bookkeeping shared by store implementations.
/// Mutates the record in place and returns the decision plus the TTL the
/// record must be persisted with.  The quota threshold is computed from
/// the violation count as it stood when the tick began.
pub fn apply_quota(
    record: &mut RateLimitRecord,
    now_ms: u64,
    policy: &QuotaPolicy,
) -> (Admit, Duration) {
    if now_ms.saturating_sub(record.window_start_ms) > policy.window_ms {
        // Violations survive the reset; only record expiry forgives them.
        record.count = 0;
        record.window_start_ms = now_ms;
    }
    record.count += 1;

    let max_requests = if record.violations > policy.strike_threshold {
        policy.strike_max_requests
    } else {
        policy.max_requests
    };

    if record.count > max_requests {
        record.violations += 1;
        let backoff = policy
            .backoff_base_secs
            .saturating_mul(2u64.saturating_pow(record.violations))
            .min(policy.backoff_cap_secs);
        (
            Admit {
                allowed: false,
                retry_after_secs: Some(backoff),
            },
            Duration::from_secs(backoff),
        )
    } else {
        (
            Admit {
                allowed: true,
                retry_after_secs: None,
            },
            Duration::from_millis(policy.window_ms),
        )
    }
}

/// Key-value store holding rate-limit records with a TTL.  The single
/// `tick` operation performs the load-modify-persist sequence atomically
/// per key, so concurrent bursts from one identity cannot overshoot the
/// quota through interleaved reads and writes.
#[async_trait::async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn tick(&self, key: &str, now_ms: u64, policy: &QuotaPolicy) -> Admit;
}

struct StoredRecord {
    record: RateLimitRecord,
    expires_at_ms: u64,
}

const SWEEP_INTERVAL: u64 = 1024;

/// Process-local store backed by a concurrent map.  Entries expire by TTL
/// on access, with a periodic sweep reclaiming idle keys.  Effective only
/// within a single long-lived process; cross-instance deployments need a
/// shared store behind the same trait.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredRecord>,
    ticks: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn maybe_sweep(&self, now_ms: u64) {
        let n = self.ticks.fetch_add(1, Ordering::Relaxed);
        if n % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.entries.retain(|_, stored| stored.expires_at_ms > now_ms);
        }
    }
}

#[async_trait::async_trait]
impl RateLimitStore for MemoryStore {
    async fn tick(&self, key: &str, now_ms: u64, policy: &QuotaPolicy) -> Admit {
        let admit = {
            // The entry guard serializes concurrent ticks for one key.
            let mut entry = self
                .entries
                .entry(key.to_string())
                .or_insert_with(|| StoredRecord {
                    record: RateLimitRecord::new(now_ms),
                    expires_at_ms: now_ms.saturating_add(policy.window_ms),
                });
            if now_ms >= entry.expires_at_ms {
                entry.record = RateLimitRecord::new(now_ms);
            }
            let (admit, ttl) = apply_quota(&mut entry.record, now_ms, policy);
            entry.expires_at_ms = now_ms.saturating_add(ttl.as_millis() as u64);
            admit
        };
        self.maybe_sweep(now_ms);
        admit
    }
}

/// Admits or rejects a request against the per-identity quota.
pub struct RateLimitGate {
    store: Arc<dyn RateLimitStore>,
    policy: QuotaPolicy,
}

impl RateLimitGate {
    pub fn new(store: Arc<dyn RateLimitStore>, policy: QuotaPolicy) -> Self {
        RateLimitGate { store, policy }
    }
}

#[async_trait::async_trait]
impl Gate for RateLimitGate {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn eval(&self, ctx: &GateContext) -> Option<Rejection> {
        let admit = self
            .store
            .tick(&ctx.identity.store_key(), ctx.now_ms, &self.policy)
            .await;
        if admit.allowed {
            None
        } else {
            let mut rejection = Rejection::new(429, "Rate limit exceeded");
            rejection.retry_after = admit.retry_after_secs;
            Some(rejection)
        }
    }
}
