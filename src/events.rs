//! Normalized event types produced by the decoder.
//!
//! Mirrors the frozen/validated-vs-bypass construction split of the
//! original feed's event models: [`BestLevelEvent::new`] and
//! [`FullDepthEvent::new`] validate their inputs and are safe for tests
//! and untrusted data, while `_unchecked` constructors skip validation
//! entirely and are reserved for the decoder's hot path, which only ever
//! feeds them already-known-good values straight off the wire.

use crate::error::EventError;

/// Market session flag carried on every bid/ask side of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionFlag {
    Undefined = 0,
    Normal = 1,
    OpeningAuction = 2,
    ClosingAuction = 3,
}

impl SessionFlag {
    /// True for the opening or closing auction sessions, where prices are
    /// typically zero and should not be treated as tradable quotes.
    pub fn is_auction(self) -> bool {
        matches!(self, SessionFlag::OpeningAuction | SessionFlag::ClosingAuction)
    }

    fn from_u8(v: u8) -> Result<Self, EventError> {
        match v {
            0 => Ok(SessionFlag::Undefined),
            1 => Ok(SessionFlag::Normal),
            2 => Ok(SessionFlag::OpeningAuction),
            3 => Ok(SessionFlag::ClosingAuction),
            other => Err(EventError::InvalidFlag(other)),
        }
    }

    /// Builds a flag directly from a raw wire value without validating it.
    /// Hot-path only: the caller must already know `v <= 3`.
    fn from_u8_unchecked(v: u8) -> Self {
        match v {
            0 => SessionFlag::Undefined,
            1 => SessionFlag::Normal,
            2 => SessionFlag::OpeningAuction,
            _ => SessionFlag::ClosingAuction,
        }
    }
}

/// Top-of-book bid/ask snapshot. The default, lowest-overhead event type.
#[derive(Debug, Clone)]
pub struct BestLevelEvent {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub bid_vol: u64,
    pub ask_vol: u64,
    pub bid_flag: SessionFlag,
    pub ask_flag: SessionFlag,
    pub recv_ts: u64,
    pub recv_mono_ns: u64,
    pub conn_epoch: u32,
}

impl BestLevelEvent {
    /// Validates `symbol` and flag bytes before constructing. Safe for
    /// tests and externally supplied data.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        bid: f64,
        ask: f64,
        bid_vol: u64,
        ask_vol: u64,
        bid_flag: u8,
        ask_flag: u8,
        recv_ts: u64,
        recv_mono_ns: u64,
        conn_epoch: u32,
    ) -> Result<Self, EventError> {
        let symbol = symbol.into();
        if symbol.is_empty() {
            return Err(EventError::EmptySymbol);
        }
        Ok(Self {
            symbol,
            bid,
            ask,
            bid_vol,
            ask_vol,
            bid_flag: SessionFlag::from_u8(bid_flag)?,
            ask_flag: SessionFlag::from_u8(ask_flag)?,
            recv_ts,
            recv_mono_ns,
            conn_epoch,
        })
    }

    /// Constructs without validation. Decoder hot path only.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_unchecked(
        symbol: String,
        bid: f64,
        ask: f64,
        bid_vol: u64,
        ask_vol: u64,
        bid_flag: u8,
        ask_flag: u8,
        recv_ts: u64,
        recv_mono_ns: u64,
        conn_epoch: u32,
    ) -> Self {
        Self {
            symbol,
            bid,
            ask,
            bid_vol,
            ask_vol,
            bid_flag: SessionFlag::from_u8_unchecked(bid_flag),
            ask_flag: SessionFlag::from_u8_unchecked(ask_flag),
            recv_ts,
            recv_mono_ns,
            conn_epoch,
        }
    }
}

/// Bit-for-bit comparison of an `f64`, so floats can participate in
/// structural equality/hashing. This treats distinct NaN bit patterns as
/// unequal, which never arises on the decoder hot path (prices are
/// computed from finite integer/nanos pairs, never from NaN-producing
/// arithmetic).
fn f64_eq_bits(a: f64, b: f64) -> bool {
    a.to_bits() == b.to_bits()
}

fn hash_f64<H: std::hash::Hasher>(value: f64, state: &mut H) {
    value.to_bits().hash(state);
}

impl PartialEq for BestLevelEvent {
    fn eq(&self, other: &Self) -> bool {
        self.symbol == other.symbol
            && f64_eq_bits(self.bid, other.bid)
            && f64_eq_bits(self.ask, other.ask)
            && self.bid_vol == other.bid_vol
            && self.ask_vol == other.ask_vol
            && self.bid_flag == other.bid_flag
            && self.ask_flag == other.ask_flag
            && self.recv_ts == other.recv_ts
            && self.recv_mono_ns == other.recv_mono_ns
            && self.conn_epoch == other.conn_epoch
    }
}

impl Eq for BestLevelEvent {}

impl std::hash::Hash for BestLevelEvent {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.symbol.hash(state);
        hash_f64(self.bid, state);
        hash_f64(self.ask, state);
        self.bid_vol.hash(state);
        self.ask_vol.hash(state);
        self.bid_flag.hash(state);
        self.ask_flag.hash(state);
        self.recv_ts.hash(state);
        self.recv_mono_ns.hash(state);
        self.conn_epoch.hash(state);
    }
}

/// Full 10-level depth snapshot. Allocates more than [`BestLevelEvent`]
/// per message; intended for consumers that need book depth, not
/// sub-100us strategies.
#[derive(Debug, Clone)]
pub struct FullDepthEvent {
    pub symbol: String,
    pub bid_prices: [f64; 10],
    pub ask_prices: [f64; 10],
    pub bid_volumes: [u64; 10],
    pub ask_volumes: [u64; 10],
    pub bid_flag: SessionFlag,
    pub ask_flag: SessionFlag,
    pub recv_ts: u64,
    pub recv_mono_ns: u64,
    pub conn_epoch: u32,
}

impl FullDepthEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        bid_prices: [f64; 10],
        ask_prices: [f64; 10],
        bid_volumes: [u64; 10],
        ask_volumes: [u64; 10],
        bid_flag: u8,
        ask_flag: u8,
        recv_ts: u64,
        recv_mono_ns: u64,
        conn_epoch: u32,
    ) -> Result<Self, EventError> {
        let symbol = symbol.into();
        if symbol.is_empty() {
            return Err(EventError::EmptySymbol);
        }
        Ok(Self {
            symbol,
            bid_prices,
            ask_prices,
            bid_volumes,
            ask_volumes,
            bid_flag: SessionFlag::from_u8(bid_flag)?,
            ask_flag: SessionFlag::from_u8(ask_flag)?,
            recv_ts,
            recv_mono_ns,
            conn_epoch,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_unchecked(
        symbol: String,
        bid_prices: [f64; 10],
        ask_prices: [f64; 10],
        bid_volumes: [u64; 10],
        ask_volumes: [u64; 10],
        bid_flag: u8,
        ask_flag: u8,
        recv_ts: u64,
        recv_mono_ns: u64,
        conn_epoch: u32,
    ) -> Self {
        Self {
            symbol,
            bid_prices,
            ask_prices,
            bid_volumes,
            ask_volumes,
            bid_flag: SessionFlag::from_u8_unchecked(bid_flag),
            ask_flag: SessionFlag::from_u8_unchecked(ask_flag),
            recv_ts,
            recv_mono_ns,
            conn_epoch,
        }
    }
}

impl PartialEq for FullDepthEvent {
    fn eq(&self, other: &Self) -> bool {
        self.symbol == other.symbol
            && (0..10).all(|i| f64_eq_bits(self.bid_prices[i], other.bid_prices[i]))
            && (0..10).all(|i| f64_eq_bits(self.ask_prices[i], other.ask_prices[i]))
            && self.bid_volumes == other.bid_volumes
            && self.ask_volumes == other.ask_volumes
            && self.bid_flag == other.bid_flag
            && self.ask_flag == other.ask_flag
            && self.recv_ts == other.recv_ts
            && self.recv_mono_ns == other.recv_mono_ns
            && self.conn_epoch == other.conn_epoch
    }
}

impl Eq for FullDepthEvent {}

impl std::hash::Hash for FullDepthEvent {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.symbol.hash(state);
        for price in &self.bid_prices {
            hash_f64(*price, state);
        }
        for price in &self.ask_prices {
            hash_f64(*price, state);
        }
        self.bid_volumes.hash(state);
        self.ask_volumes.hash(state);
        self.bid_flag.hash(state);
        self.ask_flag.hash(state);
        self.recv_ts.hash(state);
        self.recv_mono_ns.hash(state);
        self.conn_epoch.hash(state);
    }
}

/// Union of event types the decoder may produce, depending on
/// [`crate::config::DecoderConfig::full_depth`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FeedEvent {
    Best(BestLevelEvent),
    Full(FullDepthEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    mod session_flag_tests {
        use super::*;

        #[test]
        fn is_auction_true_only_for_opening_and_closing() {
            assert!(!SessionFlag::Undefined.is_auction());
            assert!(!SessionFlag::Normal.is_auction());
            assert!(SessionFlag::OpeningAuction.is_auction());
            assert!(SessionFlag::ClosingAuction.is_auction());
        }

        #[test]
        fn from_u8_rejects_out_of_range() {
            assert!(SessionFlag::from_u8(4).is_err());
            assert!(SessionFlag::from_u8(255).is_err());
        }

        #[test]
        fn from_u8_unchecked_matches_validated_for_valid_inputs() {
            for v in 0u8..=3 {
                assert_eq!(
                    SessionFlag::from_u8(v).unwrap(),
                    SessionFlag::from_u8_unchecked(v)
                );
            }
        }
    }

    mod best_level_event_tests {
        use super::*;

        #[test]
        fn new_rejects_empty_symbol() {
            let err = BestLevelEvent::new("", 25.5, 26.0, 1000, 500, 1, 1, 0, 0, 0);
            assert!(matches!(err, Err(EventError::EmptySymbol)));
        }

        #[test]
        fn new_rejects_invalid_flag() {
            let err = BestLevelEvent::new("AOT", 25.5, 26.0, 1000, 500, 9, 1, 0, 0, 0);
            assert!(matches!(err, Err(EventError::InvalidFlag(9))));
        }

        #[test]
        fn new_accepts_valid_event() {
            let event = BestLevelEvent::new("AOT", 25.5, 26.0, 1000, 500, 1, 1, 10, 20, 3).unwrap();
            assert_eq!(event.symbol, "AOT");
            assert_eq!(event.bid_flag, SessionFlag::Normal);
            assert_eq!(event.conn_epoch, 3);
        }

        #[test]
        fn new_unchecked_skips_validation() {
            let event = BestLevelEvent::new_unchecked(
                "AOT".to_string(),
                0.0,
                0.0,
                0,
                0,
                2,
                2,
                0,
                0,
                1,
            );
            assert_eq!(event.bid_flag, SessionFlag::OpeningAuction);
            assert!(event.bid_flag.is_auction());
        }
    }

    mod full_depth_event_tests {
        use super::*;

        #[test]
        fn new_rejects_empty_symbol() {
            let err = FullDepthEvent::new(
                "",
                [0.0; 10],
                [0.0; 10],
                [0; 10],
                [0; 10],
                1,
                1,
                0,
                0,
                0,
            );
            assert!(matches!(err, Err(EventError::EmptySymbol)));
        }

        #[test]
        fn new_preserves_level_ordering() {
            let mut bid_prices = [0.0; 10];
            for (i, p) in bid_prices.iter_mut().enumerate() {
                *p = 25.0 - i as f64 * 0.1;
            }
            let event = FullDepthEvent::new(
                "AOT",
                bid_prices,
                [0.0; 10],
                [0; 10],
                [0; 10],
                1,
                1,
                0,
                0,
                0,
            )
            .unwrap();
            assert_eq!(event.bid_prices[0], 25.0);
            assert_eq!(event.bid_prices[9], 24.1);
        }
    }

    mod hash_equality_tests {
        use super::*;
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        fn hash_of<T: Hash>(value: &T) -> u64 {
            let mut hasher = DefaultHasher::new();
            value.hash(&mut hasher);
            hasher.finish()
        }

        #[test]
        fn equal_best_level_events_are_equal_and_hash_equally() {
            let a = BestLevelEvent::new("AOT", 25.5, 26.0, 1000, 500, 1, 1, 10, 20, 3).unwrap();
            let b = BestLevelEvent::new_unchecked(
                "AOT".to_string(),
                25.5,
                26.0,
                1000,
                500,
                1,
                1,
                10,
                20,
                3,
            );
            assert_eq!(a, b);
            assert_eq!(hash_of(&a), hash_of(&b));
        }

        #[test]
        fn equal_full_depth_events_are_equal_and_hash_equally() {
            let a = FullDepthEvent::new(
                "AOT",
                [1.0; 10],
                [2.0; 10],
                [10; 10],
                [20; 10],
                1,
                1,
                0,
                0,
                0,
            )
            .unwrap();
            let b = FullDepthEvent::new(
                "AOT",
                [1.0; 10],
                [2.0; 10],
                [10; 10],
                [20; 10],
                1,
                1,
                0,
                0,
                0,
            )
            .unwrap();
            assert_eq!(a, b);
            assert_eq!(hash_of(&a), hash_of(&b));
        }

        #[test]
        fn feed_event_wraps_hash_and_eq_through_its_variant() {
            let a = FeedEvent::Best(
                BestLevelEvent::new("AOT", 25.5, 26.0, 1000, 500, 1, 1, 10, 20, 3).unwrap(),
            );
            let b = FeedEvent::Best(
                BestLevelEvent::new("AOT", 25.5, 26.0, 1000, 500, 1, 1, 10, 20, 3).unwrap(),
            );
            assert_eq!(a, b);
            assert_eq!(hash_of(&a), hash_of(&b));
        }
    }
}
