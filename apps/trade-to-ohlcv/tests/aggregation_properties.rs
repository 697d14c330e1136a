//! Aggregation Property Tests
//!
//! Checks window aggregation invariants over generated trade tapes.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

use std::collections::HashSet;

use proptest::prelude::*;

use trade_to_ohlcv::{Candle, Trade, WindowAggregator, WindowConfig, align_window_start};

const SYMBOLS: [&str; 3] = ["BTC/USD", "ETH/USD", "SOL/USD"];

fn trade_strategy() -> impl Strategy<Value = Trade> {
    (0..SYMBOLS.len(), 1.0f64..1_000.0, 0.001f64..10.0, 0i64..600_000).prop_map(
        |(symbol, price, quantity, ts)| Trade::new(SYMBOLS[symbol], price, quantity, ts).unwrap(),
    )
}

fn config_strategy() -> impl Strategy<Value = WindowConfig> {
    (
        prop::sample::select(vec![1_000i64, 15_000, 60_000]),
        0i64..120_000,
    )
        .prop_map(|(duration, tolerance)| WindowConfig::new(duration, tolerance).unwrap())
}

/// Run a tape to completion; returns every finalized candle in emission order.
fn run(config: WindowConfig, trades: &[Trade]) -> (Vec<Candle>, WindowAggregator) {
    let mut aggregator = WindowAggregator::new(config);
    let mut emitted = Vec::new();
    for trade in trades {
        emitted.extend(aggregator.apply(trade.clone()));
    }
    emitted.extend(aggregator.flush());
    (emitted, aggregator)
}

fn close_enough(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

proptest! {
    #[test]
    fn candles_respect_price_bounds(
        config in config_strategy(),
        trades in prop::collection::vec(trade_strategy(), 0..200),
    ) {
        let (candles, _) = run(config, &trades);
        for candle in &candles {
            prop_assert!(candle.low() <= candle.open_price().min(candle.close()));
            prop_assert!(candle.high() >= candle.open_price().max(candle.close()));
            prop_assert!(candle.is_consistent());
            prop_assert_eq!(
                candle.window_end_ms() - candle.window_start_ms(),
                config.window_duration_ms()
            );
        }
    }

    #[test]
    fn applied_trades_are_conserved(
        config in config_strategy(),
        trades in prop::collection::vec(trade_strategy(), 0..200),
    ) {
        // Replay the late decision alongside the aggregator to know which
        // trades must be reflected in the output.
        let mut shadow = WindowAggregator::new(config);
        let mut expected_volume = 0.0;
        let mut expected_count = 0i64;
        for trade in &trades {
            if !shadow.is_late(trade.timestamp_ms()) {
                expected_volume += trade.quantity();
                expected_count += 1;
            }
            let _ = shadow.apply(trade.clone());
        }

        let (candles, aggregator) = run(config, &trades);
        let volume: f64 = candles.iter().map(Candle::volume).sum();
        let count: i64 = candles.iter().map(Candle::trade_count).sum();

        prop_assert!(close_enough(volume, expected_volume), "{volume} != {expected_volume}");
        prop_assert_eq!(count, expected_count);
        prop_assert_eq!(
            u64::try_from(count).unwrap() + aggregator.late_trades(),
            trades.len() as u64
        );
    }

    #[test]
    fn windowing_is_deterministic(
        config in config_strategy(),
        trades in prop::collection::vec(trade_strategy(), 0..200),
    ) {
        let (first, _) = run(config, &trades);
        let (second, _) = run(config, &trades);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn each_symbol_is_emitted_in_increasing_window_order(
        config in config_strategy(),
        trades in prop::collection::vec(trade_strategy(), 0..200),
    ) {
        let (candles, _) = run(config, &trades);
        for symbol in SYMBOLS {
            let starts: Vec<i64> = candles
                .iter()
                .filter(|c| c.symbol() == symbol)
                .map(Candle::window_start_ms)
                .collect();
            prop_assert!(starts.windows(2).all(|w| w[0] < w[1]), "{symbol}: {starts:?}");
        }

        let keys: HashSet<_> = candles.iter().map(Candle::key).collect();
        prop_assert_eq!(keys.len(), candles.len());
    }

    #[test]
    fn sorted_tape_has_no_late_trades(
        config in config_strategy(),
        mut trades in prop::collection::vec(trade_strategy(), 0..200),
    ) {
        trades.sort_by_key(Trade::timestamp_ms);
        let (_, aggregator) = run(config, &trades);
        prop_assert_eq!(aggregator.late_trades(), 0);
    }

    #[test]
    fn late_trades_never_reach_a_candle(
        trades in prop::collection::vec(trade_strategy(), 1..100),
        straggler_price in 1_000_000.0f64..2_000_000.0,
    ) {
        let config = WindowConfig::new(60_000, 0).unwrap();
        let mut aggregator = WindowAggregator::new(config);
        let mut candles = Vec::new();
        for trade in &trades {
            candles.extend(aggregator.apply(trade.clone()));
        }

        // Anything strictly before the first open window is late.
        let watermark = aggregator.watermark().unwrap();
        let late_ts = align_window_start(watermark, 60_000) - 60_000;
        let before = aggregator.late_trades();
        candles.extend(aggregator.apply(Trade::new("BTC/USD", straggler_price, 1.0, late_ts).unwrap()));
        candles.extend(aggregator.flush());

        prop_assert_eq!(aggregator.late_trades(), before + 1);
        prop_assert!(candles.iter().all(|c| c.high() < 1_000_000.0));
    }
}

// =============================================================================
// Scenarios
// =============================================================================

fn trade(price: f64, quantity: f64, ts: i64) -> Trade {
    Trade::new("BTC/USD", price, quantity, ts).unwrap()
}

#[test]
fn three_trade_scenario_finalizes_first_window() {
    let mut aggregator = WindowAggregator::new(WindowConfig::new(60_000, 0).unwrap());

    assert!(aggregator.apply(trade(100.0, 1.0, 0)).is_empty());
    assert!(aggregator.apply(trade(105.0, 2.0, 30_000)).is_empty());
    let finalized = aggregator.apply(trade(95.0, 1.0, 65_000));

    assert_eq!(finalized.len(), 1);
    let candle = &finalized[0];
    assert_eq!(candle.open_price(), 100.0);
    assert_eq!(candle.high(), 105.0);
    assert_eq!(candle.low(), 100.0);
    assert_eq!(candle.close(), 105.0);
    assert_eq!(candle.volume(), 3.0);
    assert_eq!(candle.window_start_ms(), 0);
    assert_eq!(candle.window_end_ms(), 60_000);
}

#[test]
fn default_tolerance_holds_window_one_extra_period() {
    let mut aggregator = WindowAggregator::new(WindowConfig::with_default_tolerance(60_000).unwrap());

    let _ = aggregator.apply(trade(100.0, 1.0, 0));
    let _ = aggregator.apply(trade(105.0, 2.0, 30_000));
    assert!(aggregator.apply(trade(95.0, 1.0, 65_000)).is_empty());

    // A straggler for the first window is still absorbed.
    assert!(aggregator.apply(trade(90.0, 1.0, 50_000)).is_empty());

    let finalized = aggregator.apply(trade(96.0, 1.0, 120_000));
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].low(), 90.0);
    assert_eq!(finalized[0].close(), 90.0);
    assert_eq!(finalized[0].trade_count(), 3);
}

#[test]
fn straggler_after_eviction_is_dropped_and_counted() {
    let mut aggregator = WindowAggregator::new(WindowConfig::new(60_000, 0).unwrap());

    let _ = aggregator.apply(trade(100.0, 1.0, 0));
    let finalized = aggregator.apply(trade(95.0, 1.0, 65_000));
    assert_eq!(finalized.len(), 1);

    assert!(aggregator.apply(trade(500.0, 9.0, 10_000)).is_empty());
    assert_eq!(aggregator.late_trades(), 1);

    let rest = aggregator.flush();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].window_start_ms(), 60_000);
    assert_eq!(rest[0].volume(), 1.0);
}
