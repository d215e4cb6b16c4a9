//! End-to-end pipeline test: decode raw frames, push the resulting
//! events through the dispatcher, and confirm feed health tracks
//! arrival. No network, no MQTT broker — this exercises the
//! decode → dispatch → health-observe path the way a consumer thread
//! actually uses it.

use mdfeed::decoder::{Decoder, DecoderConfig, Money, RawBidOfferFrame};
use mdfeed::dispatcher::{Dispatcher, DispatcherConfig};
use mdfeed::events::FeedEvent;
use mdfeed::health::{FeedHealthMonitor, HealthConfig};

fn frame(symbol: &str, bid_units: i64, ask_units: i64) -> RawBidOfferFrame {
    RawBidOfferFrame {
        symbol: symbol.to_string(),
        bid_prices: [Money { units: bid_units, nanos: 0 }; 10],
        ask_prices: [Money { units: ask_units, nanos: 0 }; 10],
        bid_volumes: [100; 10],
        ask_volumes: [100; 10],
        bid_flag: 1,
        ask_flag: 1,
    }
}

#[test]
fn best_level_frames_flow_from_decoder_to_dispatcher() {
    let decoder = Decoder::new(DecoderConfig { full_depth: false });
    decoder.subscribe("aot");

    let dispatcher: Dispatcher<FeedEvent> = Dispatcher::new(DispatcherConfig::default());
    let mut health = FeedHealthMonitor::new(HealthConfig::default());

    let topic = "proto/topic/bidofferv3/AOT";
    let mono_ns: u64 = 1_000_000_000;

    decoder.on_message(topic, &frame("AOT", 25, 26), 0, mono_ns, 1, &mut |event| {
        dispatcher.push(event);
    });

    health.on_event("AOT", mono_ns);

    let stats = decoder.stats();
    assert_eq!(stats.messages_parsed, 1);
    assert_eq!(stats.parse_errors, 0);

    let polled = dispatcher.poll(10).expect("valid max_events");
    assert_eq!(polled.len(), 1);
    match &polled[0] {
        FeedEvent::Best(best) => {
            assert_eq!(best.symbol, "AOT");
            assert_eq!(best.bid, 25.0);
            assert_eq!(best.ask, 26.0);
            assert_eq!(best.conn_epoch, 1);
        }
        FeedEvent::Full(_) => panic!("expected a best-level event"),
    }

    assert!(health.has_seen("AOT"));
    assert!(!health.is_stale("AOT", mono_ns));
    assert!(!health.is_feed_dead(mono_ns));
}

#[test]
fn unsubscribed_symbol_frames_still_decode_but_are_unregistered() {
    let decoder = Decoder::new(DecoderConfig { full_depth: false });
    // Deliberately skip decoder.subscribe — the decoder decodes whatever
    // arrives on a matching topic; subscription bookkeeping only governs
    // what the transport asks the broker for.
    let mut received = Vec::new();

    decoder.on_message(
        "proto/topic/bidofferv3/PTT",
        &frame("PTT", 10, 11),
        0,
        1,
        1,
        &mut |event| received.push(event),
    );

    assert_eq!(received.len(), 1);
    assert!(decoder.subscribed_symbols().is_empty());
}

#[test]
fn dispatcher_overflow_drops_oldest_and_health_notices_the_resulting_gap() {
    let config = DispatcherConfig {
        maxlen: 4,
        ..DispatcherConfig::default()
    };
    let dispatcher: Dispatcher<u64> = Dispatcher::new(config);
    for i in 0..10u64 {
        dispatcher.push(i);
    }

    let stats = dispatcher.stats();
    assert_eq!(stats.queue_len, 4);
    assert_eq!(stats.total_pushed, 10);
    assert_eq!(stats.total_dropped, 6);

    let remaining = dispatcher.poll(10).unwrap();
    assert_eq!(remaining, vec![6, 7, 8, 9]);

    let mut health = HealthConfig::default();
    health.max_gap_seconds = 1.0;
    let mut monitor = FeedHealthMonitor::new(health);
    monitor.on_event("AOT", 0);
    assert!(monitor.is_stale("AOT", 2_000_000_000));
}
