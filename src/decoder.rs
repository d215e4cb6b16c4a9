//! Decodes already-parsed wire frames into normalized [`FeedEvent`]s and
//! forwards them to a consumer callback.
//!
//! Binary frame parsing itself (the protocol-specific wire format) is out
//! of scope for this crate — [`RawBidOfferFrame`] stands in for whatever
//! typed, already-decoded frame a protocol layer hands this module.
//! What belongs here is everything downstream of that: normalization,
//! inline Money conversion, per-symbol subscription bookkeeping, and the
//! two-phase parse/callback error isolation that keeps a single bad
//! message from ever corrupting the wrong counter.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::events::{BestLevelEvent, FeedEvent, FullDepthEvent};

/// Log the first N errors of a given kind with full detail, then only
/// every Nth occurrence after that — keeps a broken feed from flooding
/// logs at message-rate frequency.
const LOG_FIRST_N: u64 = 10;
const LOG_EVERY_N: u64 = 1000;

const TOPIC_PREFIX: &str = "proto/topic/bidofferv3/";

/// Configuration for [`Decoder`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderConfig {
    /// Produce [`FullDepthEvent`]s (10 levels) instead of
    /// [`BestLevelEvent`]s (top-of-book only). Full depth allocates more
    /// per message and is not intended for sub-100us strategies.
    pub full_depth: bool,
}

/// A single exchange-style fixed-point price: `units + nanos * 1e-9`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Money {
    pub units: i64,
    pub nanos: i32,
}

/// Converts a [`Money`] value to `f64`. **Not for the hot path** — the
/// decoder inlines `units as f64 + nanos as f64 * 1e-9` directly to avoid
/// the call overhead. Provided for external callers and tests.
pub fn money_to_float(money: Money) -> f64 {
    money.units as f64 + money.nanos as f64 * 1e-9
}

/// Already-parsed 10-level bid/offer frame, as handed off by the protocol
/// layer. Stands in for whatever typed frame a real wire decoder produces.
#[derive(Debug, Clone)]
pub struct RawBidOfferFrame {
    pub symbol: String,
    pub bid_prices: [Money; 10],
    pub ask_prices: [Money; 10],
    pub bid_volumes: [u64; 10],
    pub ask_volumes: [u64; 10],
    pub bid_flag: u8,
    pub ask_flag: u8,
}

/// Snapshot of decoder counters.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderStats {
    pub subscribed_symbols: Vec<String>,
    pub messages_parsed: u64,
    pub parse_errors: u64,
    pub callback_errors: u64,
    pub full_depth: bool,
}

/// Normalizes raw frames into [`FeedEvent`]s and dispatches them,
/// tracking per-symbol subscriptions and parse/callback error counters.
pub struct Decoder {
    config: DecoderConfig,
    subscribed_symbols: RwLock<HashSet<String>>,
    messages_parsed: AtomicU64,
    parse_errors: AtomicU64,
    callback_errors: AtomicU64,
}

impl Decoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            config,
            subscribed_symbols: RwLock::new(HashSet::new()),
            messages_parsed: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            callback_errors: AtomicU64::new(0),
        }
    }

    /// Uppercases `symbol`, returns the MQTT topic to subscribe to, and
    /// registers it in the subscription set. Idempotent: subscribing to
    /// an already-subscribed symbol (in any casing) is a no-op w.r.t. the
    /// registry and returns `None` to signal no new broker subscribe is
    /// needed.
    pub fn subscribe(&self, symbol: &str) -> Option<String> {
        let symbol = symbol.to_uppercase();
        let mut symbols = self.subscribed_symbols.write().unwrap();
        if symbols.contains(&symbol) {
            return None;
        }
        symbols.insert(symbol.clone());
        Some(format!("{TOPIC_PREFIX}{symbol}"))
    }

    /// Uppercases `symbol` and removes it from the subscription set,
    /// returning the topic that should be unsubscribed from, if it was
    /// tracked.
    pub fn unsubscribe(&self, symbol: &str) -> Option<String> {
        let symbol = symbol.to_uppercase();
        let mut symbols = self.subscribed_symbols.write().unwrap();
        if symbols.remove(&symbol) {
            Some(format!("{TOPIC_PREFIX}{symbol}"))
        } else {
            None
        }
    }

    pub fn subscribed_symbols(&self) -> HashSet<String> {
        self.subscribed_symbols.read().unwrap().clone()
    }

    pub fn stats(&self) -> DecoderStats {
        let mut symbols: Vec<String> = self.subscribed_symbols.read().unwrap().iter().cloned().collect();
        symbols.sort();
        DecoderStats {
            subscribed_symbols: symbols,
            messages_parsed: self.messages_parsed.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            callback_errors: self.callback_errors.load(Ordering::Relaxed),
            full_depth: self.config.full_depth,
        }
    }

    /// **Hot path** — decodes `frame` and forwards the normalized event
    /// to `on_event`. Runs inline on the transport's IO task.
    ///
    /// Two isolated phases: parsing the frame into an event, and invoking
    /// `on_event`. Each increments its own error counter on failure and
    /// returns early; only full success increments `messages_parsed`.
    /// Exactly one of the three counters moves per call.
    pub fn on_message(
        &self,
        topic: &str,
        frame: &RawBidOfferFrame,
        recv_ts: u64,
        recv_mono_ns: u64,
        conn_epoch: u32,
        on_event: &mut dyn FnMut(FeedEvent),
    ) {
        let event = if self.config.full_depth {
            match decode_full_depth(frame, recv_ts, recv_mono_ns, conn_epoch) {
                Ok(event) => FeedEvent::Full(event),
                Err(()) => {
                    self.log_parse_error(topic);
                    return;
                }
            }
        } else {
            match decode_best_level(frame, recv_ts, recv_mono_ns, conn_epoch) {
                Ok(event) => FeedEvent::Best(event),
                Err(()) => {
                    self.log_parse_error(topic);
                    return;
                }
            }
        };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| on_event(event)));
        if result.is_err() {
            self.log_callback_error(topic);
            return;
        }

        self.messages_parsed.fetch_add(1, Ordering::Relaxed);
    }

    fn log_parse_error(&self, topic: &str) {
        let count = self.parse_errors.fetch_add(1, Ordering::Relaxed) + 1;
        if count <= LOG_FIRST_N {
            tracing::warn!(topic, count, of = LOG_FIRST_N, "failed to parse bid/offer frame");
        } else if count % LOG_EVERY_N == 0 {
            tracing::error!(topic, count, "parse errors ongoing");
        }
    }

    fn log_callback_error(&self, topic: &str) {
        let count = self.callback_errors.fetch_add(1, Ordering::Relaxed) + 1;
        if count <= LOG_FIRST_N {
            tracing::warn!(topic, count, of = LOG_FIRST_N, "event callback error");
        } else if count % LOG_EVERY_N == 0 {
            tracing::error!(topic, count, "callback errors ongoing");
        }
    }
}

fn decode_best_level(
    frame: &RawBidOfferFrame,
    recv_ts: u64,
    recv_mono_ns: u64,
    conn_epoch: u32,
) -> Result<BestLevelEvent, ()> {
    if frame.symbol.is_empty() {
        return Err(());
    }
    let bid = frame.bid_prices[0].units as f64 + frame.bid_prices[0].nanos as f64 * 1e-9;
    let ask = frame.ask_prices[0].units as f64 + frame.ask_prices[0].nanos as f64 * 1e-9;
    Ok(BestLevelEvent::new_unchecked(
        frame.symbol.clone(),
        bid,
        ask,
        frame.bid_volumes[0],
        frame.ask_volumes[0],
        frame.bid_flag,
        frame.ask_flag,
        recv_ts,
        recv_mono_ns,
        conn_epoch,
    ))
}

fn decode_full_depth(
    frame: &RawBidOfferFrame,
    recv_ts: u64,
    recv_mono_ns: u64,
    conn_epoch: u32,
) -> Result<FullDepthEvent, ()> {
    if frame.symbol.is_empty() {
        return Err(());
    }
    let mut bid_prices = [0.0; 10];
    let mut ask_prices = [0.0; 10];
    for i in 0..10 {
        bid_prices[i] = frame.bid_prices[i].units as f64 + frame.bid_prices[i].nanos as f64 * 1e-9;
        ask_prices[i] = frame.ask_prices[i].units as f64 + frame.ask_prices[i].nanos as f64 * 1e-9;
    }
    Ok(FullDepthEvent::new_unchecked(
        frame.symbol.clone(),
        bid_prices,
        ask_prices,
        frame.bid_volumes,
        frame.ask_volumes,
        frame.bid_flag,
        frame.ask_flag,
        recv_ts,
        recv_mono_ns,
        conn_epoch,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame(symbol: &str) -> RawBidOfferFrame {
        RawBidOfferFrame {
            symbol: symbol.to_string(),
            bid_prices: [Money { units: 25, nanos: 500_000_000 }; 10],
            ask_prices: [Money { units: 26, nanos: 0 }; 10],
            bid_volumes: [1000; 10],
            ask_volumes: [500; 10],
            bid_flag: 1,
            ask_flag: 1,
        }
    }

    mod money_conversion_tests {
        use super::*;

        #[test]
        fn converts_units_and_nanos() {
            assert_eq!(money_to_float(Money { units: 25, nanos: 500_000_000 }), 25.5);
        }

        #[test]
        fn zero_converts_to_zero() {
            assert_eq!(money_to_float(Money { units: 0, nanos: 0 }), 0.0);
        }
    }

    mod subscription_tests {
        use super::*;

        #[test]
        fn symbol_normalization_is_idempotent() {
            let decoder = Decoder::new(DecoderConfig::default());
            assert!(decoder.subscribe("aot").is_some());
            assert!(decoder.subscribe("Aot").is_none());
            assert!(decoder.subscribe("AOT").is_none());
            assert_eq!(decoder.subscribed_symbols().len(), 1);
        }

        #[test]
        fn subscribe_returns_uppercased_topic() {
            let decoder = Decoder::new(DecoderConfig::default());
            let topic = decoder.subscribe("aot").unwrap();
            assert_eq!(topic, "proto/topic/bidofferv3/AOT");
        }

        #[test]
        fn unsubscribe_removes_and_returns_none_when_absent() {
            let decoder = Decoder::new(DecoderConfig::default());
            decoder.subscribe("AOT");
            assert!(decoder.unsubscribe("aot").is_some());
            assert!(decoder.unsubscribe("AOT").is_none());
        }
    }

    mod on_message_tests {
        use super::*;

        #[test]
        fn valid_frame_increments_only_messages_parsed() {
            let decoder = Decoder::new(DecoderConfig::default());
            let frame = sample_frame("AOT");
            let mut captured = None;
            decoder.on_message("t", &frame, 1, 2, 3, &mut |event| captured = Some(event));

            let stats = decoder.stats();
            assert_eq!(stats.messages_parsed, 1);
            assert_eq!(stats.parse_errors, 0);
            assert_eq!(stats.callback_errors, 0);
            match captured.unwrap() {
                FeedEvent::Best(event) => {
                    assert_eq!(event.bid, 25.5);
                    assert_eq!(event.conn_epoch, 3);
                }
                FeedEvent::Full(_) => panic!("expected best-level event"),
            }
        }

        #[test]
        fn empty_symbol_increments_only_parse_errors() {
            let decoder = Decoder::new(DecoderConfig::default());
            let frame = sample_frame("");
            decoder.on_message("t", &frame, 0, 0, 0, &mut |_| {});
            let stats = decoder.stats();
            assert_eq!(stats.parse_errors, 1);
            assert_eq!(stats.messages_parsed, 0);
            assert_eq!(stats.callback_errors, 0);
        }

        #[test]
        fn full_depth_config_produces_full_depth_event() {
            let decoder = Decoder::new(DecoderConfig { full_depth: true });
            let frame = sample_frame("AOT");
            let mut captured = None;
            decoder.on_message("t", &frame, 0, 0, 0, &mut |event| captured = Some(event));
            assert!(matches!(captured, Some(FeedEvent::Full(_))));
        }
    }
}
