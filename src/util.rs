//! Utility helpers for Palisade.
//!
//! This module exposes the memoised Aho–Corasick cache shared by the
//! pattern filter, the epoch-millisecond clock used by the gates, and a
//! constant-time byte comparison for credential checks.

use ahash::AHasher;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A memoising wrapper around `AhoCorasick::new` to avoid recompiling
/// automata for repeated lists.  The cache key is a hash of the pattern list.
static AC_CACHE: Lazy<DashMap<u64, Arc<AhoCorasick>>> = Lazy::new(DashMap::new);

/// Given a list of literal patterns, return a shared `AhoCorasick` matcher.
/// If a matcher for the list already exists in the cache, a cloned Arc is
/// returned.  Otherwise a new matcher is constructed and inserted.  The
/// caller must ensure that the pattern set does not change between calls.
pub fn ac_for(list: &[String]) -> Arc<AhoCorasick> {
    // Compute a stable hash of the pattern list.
    let mut hasher = AHasher::default();
    for pat in list {
        pat.hash(&mut hasher);
    }
    let key = hasher.finish();
    if let Some(existing) = AC_CACHE.get(&key) {
        return existing.clone();
    }
    // Build AC: case insensitive by lower-casing patterns
    let mut lower = Vec::with_capacity(list.len());
    for p in list {
        lower.push(p.to_lowercase());
    }
    let ac = AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .build(lower)
        .unwrap();
    let arc = Arc::new(ac);
    AC_CACHE.insert(key, arc.clone());
    arc
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Byte comparison that does not short-circuit on the first mismatch.
/// Length differences still return early; the secret length is not what
/// the comparison protects.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
