//! Two-tier feed health monitor: global feed liveness and per-symbol
//! staleness, both on monotonic timestamps only.
//!
//! Never uses wall-clock time — only a caller-supplied monotonic
//! nanosecond counter (e.g. `Instant::now()` converted to a `u64` epoch
//! the caller controls), so NTP adjustments never produce false
//! liveness alerts.
//!
//! Not thread-safe by convention: in this crate that convention is
//! enforced by the type system rather than documented — every mutating
//! method takes `&mut self`, so the borrow checker rejects concurrent
//! callers outright.

use std::collections::HashMap;

/// Configuration for [`FeedHealthMonitor`].
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Global maximum gap, in seconds, before the feed is considered dead.
    pub max_gap_seconds: f64,
    /// Per-symbol overrides of `max_gap_seconds`, keyed by normalized
    /// (uppercase) symbol.
    pub per_symbol_max_gap: HashMap<String, f64>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_gap_seconds: 5.0,
            per_symbol_max_gap: HashMap::new(),
        }
    }
}

/// Two-tier liveness monitor keyed on monotonic nanosecond timestamps.
pub struct FeedHealthMonitor {
    max_gap_ns: u64,
    per_symbol_max_gap_ns: HashMap<String, u64>,
    global_last_event_mono_ns: Option<u64>,
    last_event_mono_ns: HashMap<String, u64>,
}

impl FeedHealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        let max_gap_ns = (config.max_gap_seconds * 1_000_000_000.0) as u64;
        let per_symbol_max_gap_ns = config
            .per_symbol_max_gap
            .into_iter()
            .map(|(symbol, gap)| (symbol, (gap * 1_000_000_000.0) as u64))
            .collect();
        Self {
            max_gap_ns,
            per_symbol_max_gap_ns,
            global_last_event_mono_ns: None,
            last_event_mono_ns: HashMap::new(),
        }
    }

    /// Records that an event for `symbol` arrived at `now_ns`. Call this
    /// for every event consumed from the dispatcher.
    pub fn on_event(&mut self, symbol: &str, now_ns: u64) {
        self.global_last_event_mono_ns = Some(now_ns);
        self.last_event_mono_ns.insert(symbol.to_string(), now_ns);
    }

    /// False before the first event ever arrives (unknown, not dead).
    /// After that, true iff the gap since the last event strictly
    /// exceeds `max_gap_seconds`.
    pub fn is_feed_dead(&self, now_ns: u64) -> bool {
        match self.global_last_event_mono_ns {
            None => false,
            Some(last) => {
                let gap = now_ns.saturating_sub(last);
                gap > self.max_gap_ns
            }
        }
    }

    pub fn has_ever_received(&self) -> bool {
        self.global_last_event_mono_ns.is_some()
    }

    /// False for symbols never seen. Use [`Self::has_seen`] to
    /// distinguish "never tracked" from "healthy".
    pub fn is_stale(&self, symbol: &str, now_ns: u64) -> bool {
        match self.last_event_mono_ns.get(symbol) {
            None => false,
            Some(&last) => {
                let max_gap = self
                    .per_symbol_max_gap_ns
                    .get(symbol)
                    .copied()
                    .unwrap_or(self.max_gap_ns);
                let gap = now_ns.saturating_sub(last);
                gap > max_gap
            }
        }
    }

    pub fn has_seen(&self, symbol: &str) -> bool {
        self.last_event_mono_ns.contains_key(symbol)
    }

    pub fn tracked_symbol_count(&self) -> usize {
        self.last_event_mono_ns.len()
    }

    /// O(N) over tracked symbols. Returns every symbol currently stale.
    pub fn stale_symbols(&self, now_ns: u64) -> Vec<String> {
        self.last_event_mono_ns
            .iter()
            .filter_map(|(symbol, &last)| {
                let max_gap = self
                    .per_symbol_max_gap_ns
                    .get(symbol)
                    .copied()
                    .unwrap_or(self.max_gap_ns);
                let gap = now_ns.saturating_sub(last);
                (gap > max_gap).then(|| symbol.clone())
            })
            .collect()
    }

    /// Milliseconds since the last event for `symbol`, or `None` if the
    /// symbol was never seen.
    pub fn last_seen_gap_ms(&self, symbol: &str, now_ns: u64) -> Option<f64> {
        let last = *self.last_event_mono_ns.get(symbol)?;
        Some(now_ns.saturating_sub(last) as f64 / 1_000_000.0)
    }

    /// Removes tracking state for one symbol. Returns `true` if it was
    /// tracked. Does not affect global liveness.
    pub fn purge(&mut self, symbol: &str) -> bool {
        self.last_event_mono_ns.remove(symbol).is_some()
    }

    /// Clears all state back to startup (unknown) state.
    pub fn reset(&mut self) {
        self.global_last_event_mono_ns = None;
        self.last_event_mono_ns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    mod startup_tests {
        use super::*;

        #[test]
        fn is_feed_dead_false_before_first_event() {
            let monitor = FeedHealthMonitor::new(HealthConfig::default());
            assert!(!monitor.is_feed_dead(1_000_000));
            assert!(!monitor.has_ever_received());
        }

        #[test]
        fn is_stale_false_for_never_seen_symbol() {
            let monitor = FeedHealthMonitor::new(HealthConfig::default());
            assert!(!monitor.is_stale("AOT", 1_000_000));
            assert!(!monitor.has_seen("AOT"));
        }
    }

    mod global_liveness_tests {
        use super::*;

        #[test]
        fn strict_inequality_threshold() {
            let mut monitor = FeedHealthMonitor::new(HealthConfig {
                max_gap_seconds: 5.0,
                ..Default::default()
            });
            monitor.on_event("AOT", 0);
            assert!(!monitor.is_feed_dead(5 * SEC)); // exactly at threshold: not dead
            assert!(monitor.is_feed_dead(5 * SEC + 1)); // one ns over: dead
        }

        #[test]
        fn has_ever_received_true_after_first_event() {
            let mut monitor = FeedHealthMonitor::new(HealthConfig::default());
            monitor.on_event("AOT", 100);
            assert!(monitor.has_ever_received());
        }
    }

    mod per_symbol_tests {
        use super::*;

        #[test]
        fn per_symbol_override_takes_precedence_over_global() {
            let mut overrides = HashMap::new();
            overrides.insert("RARE".to_string(), 60.0);
            let mut monitor = FeedHealthMonitor::new(HealthConfig {
                max_gap_seconds: 5.0,
                per_symbol_max_gap: overrides,
            });
            monitor.on_event("RARE", 0);
            // 10s gap would be stale under the global threshold but not under RARE's 60s
            assert!(!monitor.is_stale("RARE", 10 * SEC));
        }

        #[test]
        fn symbols_without_override_use_global_threshold() {
            let mut monitor = FeedHealthMonitor::new(HealthConfig {
                max_gap_seconds: 5.0,
                ..Default::default()
            });
            monitor.on_event("AOT", 0);
            assert!(monitor.is_stale("AOT", 6 * SEC));
        }

        #[test]
        fn stale_symbols_lists_only_stale_ones() {
            let mut monitor = FeedHealthMonitor::new(HealthConfig {
                max_gap_seconds: 5.0,
                ..Default::default()
            });
            monitor.on_event("AOT", 0);
            monitor.on_event("PTT", 4 * SEC);
            let stale = monitor.stale_symbols(6 * SEC);
            assert_eq!(stale, vec!["AOT".to_string()]);
        }

        #[test]
        fn last_seen_gap_ms_none_for_unseen_symbol() {
            let monitor = FeedHealthMonitor::new(HealthConfig::default());
            assert_eq!(monitor.last_seen_gap_ms("AOT", 1_000), None);
        }

        #[test]
        fn last_seen_gap_ms_converts_ns_to_ms() {
            let mut monitor = FeedHealthMonitor::new(HealthConfig::default());
            monitor.on_event("AOT", 0);
            assert_eq!(monitor.last_seen_gap_ms("AOT", 2_500_000), Some(2.5));
        }

        #[test]
        fn purge_removes_tracked_symbol_only() {
            let mut monitor = FeedHealthMonitor::new(HealthConfig::default());
            monitor.on_event("AOT", 0);
            assert!(monitor.purge("AOT"));
            assert!(!monitor.purge("AOT"));
            assert!(!monitor.has_seen("AOT"));
        }
    }

    mod reset_tests {
        use super::*;

        #[test]
        fn reset_clears_global_and_per_symbol_state() {
            let mut monitor = FeedHealthMonitor::new(HealthConfig::default());
            monitor.on_event("AOT", 0);
            monitor.reset();
            assert!(!monitor.has_ever_received());
            assert_eq!(monitor.tracked_symbol_count(), 0);
        }
    }
}
