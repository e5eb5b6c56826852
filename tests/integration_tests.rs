//! Integration tests for the intraday options engine
//!
//! These tests drive the public API end to end: indicator readings through
//! the filter chain, closed candles through the trading engine, and the
//! position lifecycle against the paper gateway.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::watch;

use intraday_options::audit::{JsonlAuditSink, LifecycleEvent, MemoryAuditSink};
use intraday_options::config::{
    Band, DynamicGapBands, EngineConfig, RegimePolicy, RsiBounds, SessionWindow,
    StrengthGapBounds,
};
use intraday_options::data::CsvMarketData;
use intraday_options::engine::TradingEngine;
use intraday_options::filters::{rsi, session, strength_gap, timeframe, volume};
use intraday_options::indicators::{self, strength_gap_pct, IndicatorSet};
use intraday_options::oms::{
    EntryOutcome, ExitOutcome, ExitReason, ManagerSettings, PaperGateway, PaperGatewayConfig,
    PositionManager, PositionState,
};
use intraday_options::signal::{SignalAggregator, SignalType};
use intraday_options::{Candle, Config, Direction, EngineError, OptionType};

// =============================================================================
// Test Utilities
// =============================================================================

/// Reading at `h:m` exchange time (IST) with healthy volatility and RSI
fn ist_reading(index: usize, h: u32, m: u32, ps: f64, vs: f64) -> IndicatorSet {
    let ist = Utc.with_ymd_and_hms(2024, 1, 2, h, m, 0).unwrap();
    IndicatorSet {
        index,
        timestamp: ist - Duration::minutes(330),
        close: 21_510.0,
        ps,
        vs,
        atr: Some(12.0),
        atr_ratio: Some(1.2),
        rsi: Some(65.0),
        ps_vs_diff_pct: strength_gap_pct(ps, vs),
        volume: 2_000.0,
        volume_avg: Some(1_000.0),
        indeterminate: None,
    }
}

/// Buy regime without the multi-timeframe and volume stages
fn single_timeframe_policy() -> RegimePolicy {
    let mut policy = RegimePolicy::default();
    policy.multi_timeframe.enabled = false;
    policy.volume.enabled = false;
    policy.strength_gap.dynamic = None;
    policy
}

/// Config whose filters pass any valid crossover, so engine-level tests only
/// depend on when the crossover happens.
fn permissive_config() -> Config {
    let mut config = Config::default();
    config.engine.candle_interval = "1m".to_string();
    config.engine.short_interval = None;
    config.engine.utc_offset_minutes = 0;
    config.engine.order_poll_millis = 5;
    config.engine.entry_fill_timeout_secs = 1;
    config.engine.exit_fill_timeout_secs = 1;
    config.engine.candle_poll_secs = 1;
    config.engine.premium_poll_secs = 1;

    let regime = &mut config.regime;
    regime.session = SessionWindow {
        start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        end: NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
    };
    regime.atr.min_multiplier = 0.0;
    regime.rsi = RsiBounds {
        ce_max: 100.0,
        pe_min: 0.0,
    };
    regime.strength_gap = StrengthGapBounds {
        min: 0.0,
        max: 100.0,
        dynamic: None,
    };
    regime.multi_timeframe.enabled = false;
    regime.volume.enabled = false;
    config
}

fn session_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 2, 9, 15, 0).unwrap()
}

/// One-minute candle whose close sits at `clv` percent of a 20 point range
fn clv_candle(i: usize, clv: f64) -> Candle {
    let price = 21_500.0;
    let low = price - 10.0;
    Candle::new(
        session_start() + Duration::minutes(i as i64),
        price,
        price + 10.0,
        low,
        low + clv * 0.2,
        1_000.0,
    )
    .unwrap()
}

/// Generate 22 candles with a steady trend against `direction`, a reversal
/// on candle 20 that crosses PS over VS, and one more candle (21) on which
/// the crossover is evaluated.
fn generate_crossing_candles(direction: Direction) -> Vec<Candle> {
    let mut candles: Vec<Candle> = (0..20)
        .map(|i| {
            let clv = match direction {
                Direction::Up => 90.0 - 2.0 * i as f64,
                Direction::Down => 10.0 + 2.0 * i as f64,
            };
            clv_candle(i, clv)
        })
        .collect();

    let reversal = match direction {
        Direction::Up => 95.0,
        Direction::Down => 5.0,
    };
    candles.push(clv_candle(20, reversal));
    candles.push(clv_candle(21, reversal));
    candles
}

struct Harness {
    engine: TradingEngine,
    gateway: Arc<PaperGateway>,
    audit: Arc<MemoryAuditSink>,
}

fn harness(config: &Config, candles: Vec<Candle>) -> Harness {
    let gateway = Arc::new(PaperGateway::new(PaperGatewayConfig::default(), 100.0));
    let audit = Arc::new(MemoryAuditSink::new());
    let market = CsvMarketData::new().with_candles(&config.engine.candle_interval, candles);
    let engine = TradingEngine::new(
        config,
        gateway.clone(),
        gateway.clone(),
        Arc::new(market),
        audit.clone(),
    )
    .unwrap();
    Harness {
        engine,
        gateway,
        audit,
    }
}

fn manager_settings() -> ManagerSettings {
    ManagerSettings {
        lot_size: 75,
        lot_count: 1,
        order_poll: std::time::Duration::from_millis(5),
        entry_fill_timeout: std::time::Duration::from_millis(60),
        exit_fill_timeout: std::time::Duration::from_millis(60),
    }
}

fn lifecycle_names(events: &[LifecycleEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| match e {
            LifecycleEvent::EntryRequested { .. } => "entry_requested",
            LifecycleEvent::EntryFilled { .. } => "entry_filled",
            LifecycleEvent::EntryAborted { .. } => "entry_aborted",
            LifecycleEvent::StopLossPlaced { .. } => "stop_loss_placed",
            LifecycleEvent::ProtectionFailed { .. } => "protection_failed",
            LifecycleEvent::ExitStarted { .. } => "exit_started",
            LifecycleEvent::PositionClosed { .. } => "position_closed",
            LifecycleEvent::GatewayError { .. } => "gateway_error",
        })
        .collect()
}

// =============================================================================
// Signal Aggregation Tests
// =============================================================================

#[test]
fn test_call_entry_inside_session() {
    let policy = single_timeframe_policy();
    let aggregator = SignalAggregator::new(&policy, &EngineConfig::default()).unwrap();

    // Cross UP at 10:14, evaluated at 10:15 with a 3.5% gap
    let sets = vec![
        ist_reading(0, 10, 13, 90.0, 95.0),
        ist_reading(1, 10, 14, 98.0, 96.0),
        ist_reading(2, 10, 15, 100.0, 96.5),
    ];

    // Nothing to evaluate on the crossing candle itself
    assert!(aggregator.evaluate(&sets[..2], 1, None, &policy).is_none());

    let signal = aggregator.evaluate(&sets, 2, None, &policy).unwrap();
    assert_eq!(signal.signal_type, SignalType::BuyCe);
    assert_eq!(signal.crossover.detected_index, 1);
    assert_eq!(signal.entry_index, 2);
    assert!(signal.outcomes.iter().all(|o| o.passed));

    let entry = signal.entry.unwrap();
    assert_eq!(entry.option_type, OptionType::CE);
    assert_eq!(entry.strike, 21_500.0);
    assert_eq!(entry.quantity, 75);
}

#[test]
fn test_put_blocked_by_oversold_rsi() {
    let policy = single_timeframe_policy();
    let aggregator = SignalAggregator::new(&policy, &EngineConfig::default()).unwrap();

    let mut entry = ist_reading(2, 10, 15, 96.5, 100.0);
    entry.rsi = Some(20.0);
    let sets = vec![
        ist_reading(0, 10, 13, 100.0, 95.0),
        ist_reading(1, 10, 14, 94.0, 96.0),
        entry,
    ];

    let signal = aggregator.evaluate(&sets, 2, None, &policy).unwrap();
    assert_eq!(signal.signal_type, SignalType::None);
    assert_eq!(signal.crossover.direction, Direction::Down);
    assert!(signal.entry.is_none());

    let failing = signal.failing().unwrap();
    assert_eq!(failing.filter_name, rsi::NAME);
    assert_eq!(failing.measured_value, Some(20.0));
    assert!(failing.reason.contains("20.0"));
    assert!(failing.reason.contains("25.0"));
    // Short-circuit: nothing after the RSI stage ran
    assert_eq!(signal.outcomes.last().unwrap().filter_name, rsi::NAME);
}

#[test]
fn test_crossover_before_session_is_rejected() {
    let policy = single_timeframe_policy();
    let aggregator = SignalAggregator::new(&policy, &EngineConfig::default()).unwrap();

    let sets = vec![
        ist_reading(0, 9, 44, 90.0, 95.0),
        ist_reading(1, 9, 45, 98.0, 96.0),
        ist_reading(2, 9, 46, 100.0, 96.5),
    ];

    let signal = aggregator.evaluate(&sets, 2, None, &policy).unwrap();
    assert_eq!(signal.signal_type, SignalType::None);
    assert_eq!(signal.outcomes.len(), 1);
    assert_eq!(signal.failing().unwrap().filter_name, session::NAME);
}

#[test]
fn test_shipped_configs_load() {
    let buy = Config::from_file("configs/buy_regime.json").unwrap();
    assert_eq!(buy.regime.max_concurrent_positions, 1);
    assert!(buy.engine.short_interval.is_some());

    let bounded = Config::from_file("configs/bounded_regime.json").unwrap();
    assert!(bounded.regime.atr.max_multiplier.is_some());
}

#[test]
fn test_contradictory_policy_rejected_at_construction() {
    let mut config = permissive_config();
    config.regime.rsi.ce_max = 140.0;

    let gateway = Arc::new(PaperGateway::new(PaperGatewayConfig::default(), 100.0));
    let result = TradingEngine::new(
        &config,
        gateway.clone(),
        gateway,
        Arc::new(CsvMarketData::new()),
        Arc::new(MemoryAuditSink::new()),
    );
    assert!(matches!(result, Err(EngineError::Configuration(_))));
}

// =============================================================================
// Engine Tests
// =============================================================================

#[tokio::test]
async fn test_engine_enters_call_one_candle_after_crossover() {
    let config = permissive_config();
    let candles = generate_crossing_candles(Direction::Up);
    let h = harness(&config, candles.clone());

    let mut signals = Vec::new();
    for candle in candles {
        if let Some(signal) = h.engine.process_candle(candle).await.unwrap() {
            signals.push(signal);
        }
    }

    assert_eq!(signals.len(), 1);
    let signal = &signals[0];
    assert_eq!(signal.signal_type, SignalType::BuyCe);
    assert_eq!(signal.crossover.detected_index, 20);
    assert_eq!(signal.entry_index, 21);

    let position = h.engine.manager().position().unwrap();
    assert_eq!(position.status, PositionState::Open);
    assert_eq!(position.contract.option_type, OptionType::CE);
    assert_eq!(position.entry_premium, 100.0);
    assert_eq!(position.stop_loss_price, 70.0);

    assert_eq!(
        lifecycle_names(&h.audit.events()),
        vec!["entry_requested", "entry_filled", "stop_loss_placed"]
    );
    assert_eq!(h.audit.signals().len(), 1);
}

#[tokio::test]
async fn test_engine_enters_put_on_downward_cross() {
    let config = permissive_config();
    let candles = generate_crossing_candles(Direction::Down);
    let h = harness(&config, candles.clone());

    for candle in candles {
        h.engine.process_candle(candle).await.unwrap();
    }

    let position = h.engine.manager().position().unwrap();
    assert_eq!(position.contract.option_type, OptionType::PE);
    assert_eq!(h.engine.summary().signals.buy_pe, 1);
}

#[tokio::test]
async fn test_stop_loss_round_trip_through_engine() {
    let config = permissive_config();
    let candles = generate_crossing_candles(Direction::Up);
    let h = harness(&config, candles.clone());
    for candle in candles {
        h.engine.process_candle(candle).await.unwrap();
    }

    // Premium drifts down but stays above the stop
    h.gateway.set_premium(85.0);
    assert!(h.engine.poll_premium().await.unwrap().is_none());
    let open = h.engine.manager().position().unwrap();
    assert_eq!(open.status, PositionState::Open);
    assert_eq!(open.pnl_points, -15.0);

    // Stop triggers, then fills on the next poll
    h.gateway.set_premium(70.0);
    assert!(h.engine.poll_premium().await.unwrap().is_none());
    assert_eq!(h.engine.manager().state(), PositionState::Exiting);

    let closed = h.engine.poll_premium().await.unwrap().unwrap();
    assert_eq!(closed.status, PositionState::Closed);
    assert_eq!(closed.exit_reason, Some(ExitReason::StopLoss));
    assert_eq!(closed.exit_premium, Some(70.0));
    assert_eq!(closed.pnl_points, -30.0);
    assert_eq!(closed.pnl_value, -2_250.0);
    assert_eq!(h.engine.manager().state(), PositionState::Flat);

    assert_eq!(
        lifecycle_names(&h.audit.events()),
        vec![
            "entry_requested",
            "entry_filled",
            "stop_loss_placed",
            "exit_started",
            "position_closed"
        ]
    );

    let summary = h.engine.summary();
    assert_eq!(summary.trades, 1);
    assert_eq!(summary.losers, 1);
    assert_eq!(summary.total_pnl_value, -2_250.0);
    assert!(summary.open_position.is_none());
}

#[tokio::test]
async fn test_out_of_order_candles_are_ignored() {
    let config = permissive_config();
    let candles = generate_crossing_candles(Direction::Up);
    let h = harness(&config, Vec::new());

    for candle in &candles[..10] {
        h.engine.process_candle(candle.clone()).await.unwrap();
    }
    // Replaying an older candle neither evaluates nor breaks the sequence
    assert!(h
        .engine
        .process_candle(candles[3].clone())
        .await
        .unwrap()
        .is_none());
    for candle in &candles[10..] {
        h.engine.process_candle(candle.clone()).await.unwrap();
    }
    assert_eq!(h.engine.manager().state(), PositionState::Open);
}

#[tokio::test]
async fn test_run_loop_processes_feed_until_shutdown() {
    let config = permissive_config();
    let h = harness(&config, generate_crossing_candles(Direction::Up));

    let (tx, rx) = watch::channel(false);
    let stopper = async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        tx.send(true).unwrap();
    };
    let (summary, _) = tokio::join!(h.engine.run(rx), stopper);
    let summary = summary.unwrap();

    assert_eq!(summary.signals.evaluated, 1);
    assert_eq!(summary.signals.buy_ce, 1);
    assert_eq!(summary.trades, 0);
    let open = summary.open_position.unwrap();
    assert_eq!(open.status, PositionState::Open);
}

#[tokio::test]
async fn test_csv_feed_drives_engine() {
    let config = permissive_config();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "datetime,open,high,low,close,volume").unwrap();
    for c in generate_crossing_candles(Direction::Up) {
        writeln!(
            file,
            "{},{},{},{},{},{}",
            c.datetime.format("%Y-%m-%d %H:%M:%S"),
            c.open,
            c.high,
            c.low,
            c.close,
            c.volume
        )
        .unwrap();
    }
    file.flush().unwrap();

    let market = CsvMarketData::new().load("1m", file.path()).unwrap();
    assert_eq!(market.candles("1m").len(), 22);

    let gateway = Arc::new(PaperGateway::new(PaperGatewayConfig::default(), 100.0));
    let engine = TradingEngine::new(
        &config,
        gateway.clone(),
        gateway,
        Arc::new(market),
        Arc::new(MemoryAuditSink::new()),
    )
    .unwrap();

    assert_eq!(engine.sync_candles().await.unwrap(), 22);
    // Nothing new on the second pull
    assert_eq!(engine.sync_candles().await.unwrap(), 0);
    assert_eq!(engine.manager().state(), PositionState::Open);
}

// =============================================================================
// Multi-Timeframe Feed Tests
// =============================================================================

/// Five-minute primary candles with 1m short candles underneath
fn multi_timeframe_config() -> Config {
    let mut config = permissive_config();
    config.engine.candle_interval = "5m".to_string();
    config.engine.short_interval = Some("1m".to_string());

    let regime = &mut config.regime;
    regime.multi_timeframe.enabled = true;
    regime.multi_timeframe.momentum_threshold = 0.0;
    regime.multi_timeframe.divergence_threshold_pct = 150.0;
    regime.volume.enabled = true;
    regime.volume.spike_threshold = 1.0;
    regime.strength_gap.dynamic = Some(DynamicGapBands {
        tight: Band::new(0.0, 100.0),
        wide: Band::new(0.0, 100.0),
    });
    config
}

fn five_minute_crossing_candles(direction: Direction) -> Vec<Candle> {
    generate_crossing_candles(direction)
        .into_iter()
        .enumerate()
        .map(|(i, c)| {
            Candle::new(
                session_start() + Duration::minutes(5 * i as i64),
                c.open,
                c.high,
                c.low,
                c.close,
                c.volume,
            )
            .unwrap()
        })
        .collect()
}

/// One 1m candle per minute of the primary feed (22 x 5), followed by a
/// few bearish candles starting exactly at the entry candle's close.
fn short_candles(clv_at: impl Fn(usize) -> f64) -> Vec<Candle> {
    (0..114)
        .map(|j| {
            let clv = if j < 110 { clv_at(j) } else { 0.0 };
            let low = 21_490.0;
            Candle::new(
                session_start() + Duration::minutes(j as i64),
                21_500.0,
                low + 20.0,
                low,
                low + clv * 0.2,
                500.0,
            )
            .unwrap()
        })
        .collect()
}

fn multi_timeframe_engine(config: &Config, short: Vec<Candle>) -> (TradingEngine, Arc<MemoryAuditSink>) {
    let market = CsvMarketData::new()
        .with_candles("5m", five_minute_crossing_candles(Direction::Up))
        .with_candles("1m", short);
    let gateway = Arc::new(PaperGateway::new(PaperGatewayConfig::default(), 100.0));
    let audit = Arc::new(MemoryAuditSink::new());
    let engine = TradingEngine::new(
        config,
        gateway.clone(),
        gateway,
        Arc::new(market),
        audit.clone(),
    )
    .unwrap();
    (engine, audit)
}

#[tokio::test]
async fn test_short_feed_confirms_entry_without_lookahead() {
    let config = multi_timeframe_config();
    let short = short_candles(|j| 10.0 + 0.8 * j as f64);
    let (engine, audit) = multi_timeframe_engine(&config, short.clone());

    assert_eq!(engine.sync_candles().await.unwrap(), 22);

    let signals = audit.signals();
    assert_eq!(signals.len(), 1);
    let signal = &signals[0];
    assert_eq!(signal.entry_index, 21);
    assert_eq!(signal.signal_type, SignalType::BuyCe, "{:?}", signal.failing());
    assert_eq!(signal.outcomes.len(), 8);

    // Entry candle opens at +105m and closes at +110m; the bearish 1m
    // candles from +110m on belong to its future.
    let close_time = signal.timestamp + Duration::minutes(5);
    let visible: Vec<Candle> = short
        .iter()
        .filter(|c| c.datetime < close_time)
        .cloned()
        .collect();
    assert_eq!(visible.len(), 110);

    let seen = indicators::compute(&visible, &config.regime.periods);
    let expected_gap = seen.last().unwrap().gap();
    assert!(expected_gap > 0.0);

    let with_future = indicators::compute(&short, &config.regime.periods);
    assert!(with_future.last().unwrap().gap() < 0.0);

    let outcome = |name: &str| {
        signal
            .outcomes
            .iter()
            .find(|o| o.filter_name == name)
            .unwrap()
            .clone()
    };

    let alignment = outcome(timeframe::ALIGNMENT);
    assert!(alignment.passed);
    assert!((alignment.measured_value.unwrap() - expected_gap).abs() < 1e-9);

    let momentum = outcome(timeframe::MOMENTUM);
    let expected_momentum = timeframe::momentum(&seen, 3).unwrap().abs();
    assert!((momentum.measured_value.unwrap() - expected_momentum).abs() < 1e-9);

    let divergence = outcome(timeframe::DIVERGENCE);
    assert!(divergence.passed);
    assert!(divergence.measured_value.is_some());

    let volume = outcome(volume::NAME);
    assert!(volume.passed);
    assert!((volume.measured_value.unwrap() - 1.0).abs() < 1e-9);

    let gap = outcome(strength_gap::NAME);
    assert!(gap.passed);
    assert!(gap.reason.contains("tight band"), "{}", gap.reason);

    assert_eq!(engine.manager().state(), PositionState::Open);
}

#[tokio::test]
async fn test_misaligned_short_feed_blocks_entry() {
    let config = multi_timeframe_config();
    let (engine, audit) = multi_timeframe_engine(&config, short_candles(|j| 95.0 - 0.8 * j as f64));

    assert_eq!(engine.sync_candles().await.unwrap(), 22);

    let signals = audit.signals();
    assert_eq!(signals.len(), 1);
    let signal = &signals[0];
    assert_eq!(signal.signal_type, SignalType::None);
    let failed = signal.failing().unwrap();
    assert_eq!(failed.filter_name, timeframe::ALIGNMENT);
    assert!(failed.measured_value.unwrap() < 0.0);
    // Short-circuited before the strength gap was measured
    assert_eq!(signal.outcomes.len(), 4);
    assert_eq!(engine.manager().state(), PositionState::Flat);
}

#[test]
fn test_multi_timeframe_without_short_interval_rejected() {
    let mut config = multi_timeframe_config();
    config.engine.short_interval = None;
    assert!(matches!(
        config.validate(),
        Err(EngineError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_jsonl_audit_trail() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit").join("trail.jsonl");

    let config = permissive_config();
    let gateway = Arc::new(PaperGateway::new(PaperGatewayConfig::default(), 100.0));
    let engine = TradingEngine::new(
        &config,
        gateway.clone(),
        gateway,
        Arc::new(CsvMarketData::new()),
        Arc::new(JsonlAuditSink::create(&path).unwrap()),
    )
    .unwrap();
    for candle in generate_crossing_candles(Direction::Up) {
        engine.process_candle(candle).await.unwrap();
    }

    let contents = std::fs::read_to_string(&path).unwrap();
    let records: Vec<serde_json::Value> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(records[0]["kind"], "signal");
    assert_eq!(records[0]["payload"]["signal_type"], "BUY_CE");
    let events: Vec<&str> = records[1..]
        .iter()
        .map(|r| r["payload"]["event"].as_str().unwrap())
        .collect();
    assert_eq!(
        events,
        vec!["entry_requested", "entry_filled", "stop_loss_placed"]
    );
}

// =============================================================================
// Position Lifecycle Tests
// =============================================================================

fn open_manager(
    config: PaperGatewayConfig,
) -> (PositionManager, Arc<PaperGateway>, Arc<MemoryAuditSink>) {
    let gateway = Arc::new(PaperGateway::new(config, 100.0));
    let audit = Arc::new(MemoryAuditSink::new());
    let manager = PositionManager::new(
        Arc::new(RegimePolicy::default()),
        gateway.clone(),
        audit.clone(),
        manager_settings(),
    )
    .unwrap();
    (manager, gateway, audit)
}

/// Actionable call signal taken straight from the aggregator
fn buy_ce_signal() -> intraday_options::signal::Signal {
    let policy = single_timeframe_policy();
    let aggregator = SignalAggregator::new(&policy, &EngineConfig::default()).unwrap();
    let sets = vec![
        ist_reading(0, 10, 13, 90.0, 95.0),
        ist_reading(1, 10, 14, 98.0, 96.0),
        ist_reading(2, 10, 15, 100.0, 96.5),
    ];
    aggregator.evaluate(&sets, 2, None, &policy).unwrap()
}

#[tokio::test]
async fn test_reentry_after_stop_loss() {
    let (manager, gateway, _audit) = open_manager(PaperGatewayConfig::default());
    let signal = buy_ce_signal();

    let EntryOutcome::Opened(first) = manager.on_signal(&signal).await.unwrap() else {
        panic!("expected first entry to open");
    };
    gateway.set_premium(65.0);
    manager.poll_orders().await.unwrap();
    let closed = manager.poll_orders().await.unwrap().unwrap();
    assert_eq!(closed.id, first.id);
    // Stop-limit fills at the trigger, not at the gapped premium
    assert_eq!(closed.exit_premium, Some(70.0));

    gateway.set_premium(110.0);
    let EntryOutcome::Opened(second) = manager.on_signal(&signal).await.unwrap() else {
        panic!("expected re-entry once flat");
    };
    assert_eq!(second.id, first.id + 1);
    assert_eq!(second.entry_premium, 110.0);
    assert_eq!(second.stop_loss_price, 80.0);
}

#[tokio::test]
async fn test_rejected_entry_reverts_to_flat() {
    let (manager, gateway, audit) = open_manager(PaperGatewayConfig {
        reject_entries: true,
        ..Default::default()
    });

    let EntryOutcome::Aborted { reason, .. } = manager.on_signal(&buy_ce_signal()).await.unwrap()
    else {
        panic!("expected aborted entry");
    };
    assert!(reason.contains("rejected"));
    assert_eq!(manager.state(), PositionState::Flat);
    assert_eq!(gateway.counts().stop_losses, 0);
    assert_eq!(
        lifecycle_names(&audit.events()),
        vec!["entry_requested", "entry_aborted"]
    );

    // The slot is free again
    gateway.configure(PaperGatewayConfig::default());
    assert!(matches!(
        manager.on_signal(&buy_ce_signal()).await.unwrap(),
        EntryOutcome::Opened(_)
    ));
}

#[tokio::test]
async fn test_unfilled_entry_times_out() {
    let (manager, gateway, _audit) = open_manager(PaperGatewayConfig {
        hold_entries: true,
        ..Default::default()
    });

    let outcome = manager.on_signal(&buy_ce_signal()).await.unwrap();
    assert!(matches!(outcome, EntryOutcome::Aborted { .. }));
    assert_eq!(manager.state(), PositionState::Flat);
    assert_eq!(gateway.counts().cancels, 1);
}

#[tokio::test]
async fn test_failed_protection_exits_immediately() {
    let (manager, gateway, audit) = open_manager(PaperGatewayConfig {
        fail_stop_loss: true,
        ..Default::default()
    });

    let outcome = manager.on_signal(&buy_ce_signal()).await.unwrap();
    let EntryOutcome::ProtectionFailed(position) = outcome else {
        panic!("expected protection failure, got {outcome:?}");
    };
    assert_eq!(position.status, PositionState::Closed);
    assert_eq!(position.exit_reason, Some(ExitReason::ProtectionFailed));
    assert_eq!(manager.state(), PositionState::Flat);
    assert_eq!(gateway.counts().exits, 1);

    let names = lifecycle_names(&audit.events());
    assert!(names.contains(&"gateway_error"));
    assert!(names.contains(&"protection_failed"));
    assert_eq!(names.last(), Some(&"position_closed"));
}

#[tokio::test]
async fn test_manual_exit_and_busy_signal() {
    let (manager, gateway, _audit) = open_manager(PaperGatewayConfig::default());
    let signal = buy_ce_signal();
    manager.on_signal(&signal).await.unwrap();

    assert_eq!(
        manager.on_signal(&signal).await.unwrap(),
        EntryOutcome::Busy(PositionState::Open)
    );

    gateway.set_premium(112.5);
    manager.on_premium(112.5).unwrap();
    let ExitOutcome::Closed(position) = manager.request_exit().await.unwrap() else {
        panic!("expected manual exit to close");
    };
    assert_eq!(position.exit_reason, Some(ExitReason::Manual));
    assert_eq!(position.pnl_points, 12.5);
    assert_eq!(position.pnl_value, 937.5);
    assert_eq!(gateway.counts().cancels, 1);

    // The cancelled stop never fires afterwards
    gateway.set_premium(50.0);
    assert!(manager.poll_orders().await.unwrap().is_none());
    assert_eq!(manager.closed_positions().len(), 1);
}

#[tokio::test]
async fn test_non_actionable_signal_is_ignored() {
    let (manager, gateway, _audit) = open_manager(PaperGatewayConfig::default());
    let mut signal = buy_ce_signal();
    signal.signal_type = SignalType::None;
    signal.entry = None;

    assert_eq!(
        manager.on_signal(&signal).await.unwrap(),
        EntryOutcome::NotActionable
    );
    assert_eq!(gateway.counts().entries, 0);
}
