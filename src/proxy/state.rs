//! Process-wide proxy state: active upstream plus per-upstream consecutive
//! failure counters.
//!
//! Single-writer/many-readers discipline via one `RwLock`-guarded snapshot,
//! rather than an atomic per-field approach, so cutover decisions always
//! see a consistent view of both upstreams' counters.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

/// Which upstream the proxy currently forwards to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    Primary,
    Replica,
}

impl Upstream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Upstream::Primary => "primary",
            Upstream::Replica => "replica",
        }
    }

    pub fn other(&self) -> Upstream {
        match self {
            Upstream::Primary => Upstream::Replica,
            Upstream::Replica => Upstream::Primary,
        }
    }
}

/// Point-in-time view of one upstream's health.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamSnapshot {
    pub healthy: bool,
    pub consecutive_failures: u32,
}

struct Counters {
    consecutive_failures: AtomicU32,
    healthy: std::sync::atomic::AtomicBool,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            // Unknown until the first probe; treated as unhealthy so a
            // fresh proxy doesn't claim a cutover precondition it hasn't
            // observed yet.
            healthy: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

/// Proxy state: which upstream is active, and each upstream's health
/// counters, plus the cutover hysteresis rule.
pub struct ProxyState {
    primary_url: String,
    replica_url: String,
    max_consecutive_failures: u32,
    active: RwLock<Upstream>,
    primary: Counters,
    replica: Counters,
}

impl ProxyState {
    pub fn new(primary_url: String, replica_url: String, max_consecutive_failures: u32) -> Self {
        Self {
            primary_url,
            replica_url,
            max_consecutive_failures,
            active: RwLock::new(Upstream::Primary),
            primary: Counters::default(),
            replica: Counters::default(),
        }
    }

    pub fn active(&self) -> Upstream {
        *self.active.read().expect("proxy state lock poisoned")
    }

    pub fn base_url(&self, upstream: Upstream) -> &str {
        match upstream {
            Upstream::Primary => &self.primary_url,
            Upstream::Replica => &self.replica_url,
        }
    }

    fn counters(&self, upstream: Upstream) -> &Counters {
        match upstream {
            Upstream::Primary => &self.primary,
            Upstream::Replica => &self.replica,
        }
    }

    pub fn snapshot(&self, upstream: Upstream) -> UpstreamSnapshot {
        let counters = self.counters(upstream);
        UpstreamSnapshot {
            healthy: counters.healthy.load(Ordering::SeqCst),
            consecutive_failures: counters.consecutive_failures.load(Ordering::SeqCst),
        }
    }

    /// Record one probe result for `upstream` and apply the cutover rule
    ///:
    ///
    /// - reset the failure counter to 0 on success, increment on failure;
    /// - if `active`'s own failures reach the threshold AND the other
    ///   upstream is currently healthy, switch `active` to it;
    /// - otherwise `active` stays put (a blip on one side while the other
    ///   is also down must not cause a flap).
    ///
    /// Returns `Some(new_active)` if a cutover happened.
    pub fn record_probe(&self, upstream: Upstream, healthy: bool) -> Option<Upstream> {
        let counters = self.counters(upstream);
        counters.healthy.store(healthy, Ordering::SeqCst);
        if healthy {
            counters.consecutive_failures.store(0, Ordering::SeqCst);
        } else {
            counters.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        }

        let mut active = self.active.write().expect("proxy state lock poisoned");
        if upstream != *active {
            return None;
        }

        let own_failures = self.counters(*active).consecutive_failures.load(Ordering::SeqCst);
        let other = active.other();
        let other_healthy = self.counters(other).healthy.load(Ordering::SeqCst);

        if own_failures >= self.max_consecutive_failures && other_healthy {
            *active = other;
            Some(other)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ProxyState {
        ProxyState::new("http://p".to_string(), "http://r".to_string(), 3)
    }

    #[test]
    fn starts_active_on_primary() {
        assert_eq!(state().active(), Upstream::Primary);
    }

    #[test]
    fn flips_to_replica_after_threshold_failures_while_replica_healthy() {
        let state = state();
        state.record_probe(Upstream::Replica, true);
        assert!(state.record_probe(Upstream::Primary, false).is_none());
        assert!(state.record_probe(Upstream::Primary, false).is_none());
        let cutover = state.record_probe(Upstream::Primary, false);
        assert_eq!(cutover, Some(Upstream::Replica));
        assert_eq!(state.active(), Upstream::Replica);
    }

    #[test]
    fn does_not_flip_if_standby_also_unhealthy() {
        let state = state();
        state.record_probe(Upstream::Replica, false);
        for _ in 0..5 {
            state.record_probe(Upstream::Primary, false);
        }
        assert_eq!(state.active(), Upstream::Primary);
    }

    #[test]
    fn failback_is_the_symmetric_rule() {
        let state = state();
        // Flip to replica.
        state.record_probe(Upstream::Replica, true);
        for _ in 0..3 {
            state.record_probe(Upstream::Primary, false);
        }
        assert_eq!(state.active(), Upstream::Replica);

        // Primary recovers, then replica degrades — flips back.
        state.record_probe(Upstream::Primary, true);
        for _ in 0..3 {
            state.record_probe(Upstream::Replica, false);
        }
        assert_eq!(state.active(), Upstream::Primary);
    }

    #[test]
    fn success_resets_failure_counter() {
        let state = state();
        state.record_probe(Upstream::Primary, false);
        state.record_probe(Upstream::Primary, false);
        state.record_probe(Upstream::Primary, true);
        assert_eq!(state.snapshot(Upstream::Primary).consecutive_failures, 0);
    }

    #[test]
    fn hysteresis_holds_cutover_through_a_flapping_probe_sequence() {
        // P=[OK,OK,FAIL,FAIL,FAIL,OK,OK,OK], R=[OK,OK,OK,OK,OK,OK,FAIL,FAIL]
        let state = state();
        let p = [true, true, false, false, false, true, true, true];
        let r = [true, true, true, true, true, true, false, false];

        let mut active_after = Vec::new();
        for i in 0..p.len() {
            state.record_probe(Upstream::Primary, p[i]);
            state.record_probe(Upstream::Replica, r[i]);
            active_after.push(state.active());
        }

        // After the third consecutive primary failure (index 4) with replica
        // healthy, active flips to replica. Replica's trailing run is only
        // two failures — short of the threshold — so it does not flip back
        // within this sequence.
        assert_eq!(active_after[3], Upstream::Primary);
        assert_eq!(active_after[4], Upstream::Replica);
        assert_eq!(active_after[7], Upstream::Replica);
    }
}
