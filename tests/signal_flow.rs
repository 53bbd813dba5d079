use chrono::{Duration, Utc};
use dashmap::DashSet;
use perpctl::config::{AppConfig, ExecutionConfig};
use perpctl::domain::{DenyCode, ExitType, Side, TradeStatus, TradingSignal};
use perpctl::exchange::PaperExchange;
use perpctl::orchestrator::{apply_decision, position_pass, Orchestrator, Rejection, SignalIntake};
use perpctl::persistence::{InMemoryStore, TradeStore};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::Ordering;
use std::sync::Arc;

struct Harness {
    orchestrator: Orchestrator,
    paper: Arc<PaperExchange>,
    store: Arc<InMemoryStore>,
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default_config(true);
    config.orchestrator.symbols = vec!["BTC-PERP".to_string(), "ETH-PERP".to_string()];
    config.paper.prices.insert("BTC-PERP".to_string(), dec!(50000));
    config.paper.prices.insert("ETH-PERP".to_string(), dec!(3000));
    config.execution = ExecutionConfig {
        fill_timeout_ms: 150,
        poll_interval_ms: 5,
        close_timeout_ms: 80,
        monitor_interval_ms: 5,
        ..ExecutionConfig::default()
    };
    config.exchange.read_retry_attempts = 1;
    config
}

fn harness(config: AppConfig) -> Harness {
    let paper = Arc::new(PaperExchange::new(config.paper.clone()));
    let store = Arc::new(InMemoryStore::new());
    let orchestrator = Orchestrator::new(config, paper.clone(), store.clone());
    Harness {
        orchestrator,
        paper,
        store,
    }
}

fn btc_long() -> TradingSignal {
    TradingSignal::new("BTC-PERP", Side::Long, dec!(0.8), "breakout").with_levels(
        None,
        Some(dec!(49000)),
        Some(dec!(60000)),
    )
}

fn gate_calls(h: &Harness) -> u64 {
    let metrics = &h.orchestrator.services().metrics;
    metrics.gate_approved.load(Ordering::Relaxed) + metrics.gate_denied.load(Ordering::Relaxed)
}

#[tokio::test]
async fn accepted_signal_is_sized_from_risk_budget() {
    let h = harness(test_config());
    let mut intake = SignalIntake::new(h.orchestrator.services());

    let trade = intake.handle(btc_long()).await.unwrap();

    // risk budget allows 0.2, the 10% notional cap allows 0.02
    assert_eq!(trade.status, TradeStatus::Open);
    assert_eq!(trade.size, dec!(0.02));
    assert_eq!(trade.strategy_id.as_deref(), Some("breakout"));
    assert_eq!(h.paper.net_position("BTC-PERP").await, dec!(0.02));
    assert_eq!(h.orchestrator.services().metrics.signal_rejections("position_open"), 0);
}

#[tokio::test]
async fn second_signal_for_open_symbol_never_reaches_gate() {
    let h = harness(test_config());
    let mut intake = SignalIntake::new(h.orchestrator.services());
    intake.handle(btc_long()).await.unwrap();
    let calls = gate_calls(&h);
    let mutations = h.paper.mutation_count();

    let rejected = intake.handle(btc_long()).await.unwrap_err();

    assert_eq!(rejected, Rejection::PositionOpen);
    assert_eq!(gate_calls(&h), calls);
    assert_eq!(h.paper.mutation_count(), mutations);
    assert_eq!(
        h.orchestrator.services().metrics.signal_rejections("position_open"),
        1
    );
}

#[tokio::test]
async fn cooldown_applies_after_position_closes() {
    let h = harness(test_config());
    let services = h.orchestrator.services();
    let mut intake = SignalIntake::new(services.clone());
    let trade = intake.handle(btc_long()).await.unwrap();

    services
        .engine
        .close_position(trade.trade_id, ExitType::Manual, None)
        .await
        .unwrap();

    assert_eq!(intake.handle(btc_long()).await.unwrap_err(), Rejection::Cooldown);
}

#[tokio::test]
async fn hourly_cap_counts_across_symbols() {
    let mut config = test_config();
    config.orchestrator.max_signals_per_hour = 1;
    let h = harness(config);
    let mut intake = SignalIntake::new(h.orchestrator.services());
    intake.handle(btc_long()).await.unwrap();

    let eth = TradingSignal::new("ETH-PERP", Side::Short, dec!(0.9), "breakout").with_levels(
        None,
        Some(dec!(3100)),
        None,
    );
    assert_eq!(intake.handle(eth).await.unwrap_err(), Rejection::HourlyCap);
}

#[tokio::test]
async fn screening_rejections() {
    let h = harness(test_config());
    let mut intake = SignalIntake::new(h.orchestrator.services());

    let weak = TradingSignal::new("BTC-PERP", Side::Long, dec!(0.3), "noise");
    assert_eq!(intake.handle(weak).await.unwrap_err(), Rejection::LowConfidence);

    let mut stale = btc_long();
    stale.expires_at = Some(Utc::now() - Duration::seconds(1));
    assert_eq!(intake.handle(stale).await.unwrap_err(), Rejection::Expired);

    let mut blank = btc_long();
    blank.symbol = String::new();
    assert_eq!(intake.handle(blank).await.unwrap_err(), Rejection::Invalid);

    h.paper.set_min_order_size("BTC-PERP", Decimal::ONE).await;
    assert_eq!(intake.handle(btc_long()).await.unwrap_err(), Rejection::TooSmall);
    assert_eq!(h.paper.mutation_count(), 0);
}

#[tokio::test]
async fn paused_trading_denies_at_gate() {
    let h = harness(test_config());
    let admin = h.orchestrator.admin();
    let mut intake = SignalIntake::new(h.orchestrator.services());

    admin.disable_trading("ops").await;
    assert_eq!(intake.handle(btc_long()).await.unwrap_err(), Rejection::RiskDenied);
    assert_eq!(
        h.orchestrator
            .services()
            .metrics
            .gate_denials(DenyCode::TradingPaused),
        1
    );
    assert_eq!(h.paper.mutation_count(), 0);
}

#[tokio::test]
async fn profit_level_takes_partial_exit() {
    let h = harness(test_config());
    let services = h.orchestrator.services();
    let mut intake = SignalIntake::new(services.clone());
    let trade = intake.handle(btc_long()).await.unwrap();

    h.paper.set_price("BTC-PERP", dec!(51500)).await;
    let in_flight = DashSet::new();
    let actions = position_pass(&services, &in_flight).await;
    assert_eq!(actions.len(), 1);
    assert!(in_flight.contains(&trade.trade_id));

    let (trade_id, decision) = actions.into_iter().next().unwrap();
    assert_eq!(decision.partial.as_ref().map(|p| p.level), Some(0));
    apply_decision(&services, trade_id, decision).await;

    let reduced = h.store.get_trade(trade_id).await.unwrap().unwrap();
    assert_eq!(reduced.status, TradeStatus::Open);
    assert_eq!(reduced.remaining_size, dec!(0.014));
    assert_eq!(reduced.realized_pnl, dec!(9));

    // the level is spent; the next pass only arms the trailing stop
    let checkpoint = h.store.load_positions().await.unwrap();
    assert!(checkpoint[0].profit_levels_hit.contains(&0));
    let next = position_pass(&services, &DashSet::new()).await;
    assert!(next.iter().all(|(_, d)| d.partial.is_none() && !d.should_exit));
}

#[tokio::test]
async fn stop_breach_closes_through_position_pass() {
    let h = harness(test_config());
    let services = h.orchestrator.services();
    let mut intake = SignalIntake::new(services.clone());
    let trade = intake.handle(btc_long()).await.unwrap();

    // the resting exchange stop fills on the cross; whichever of the OCO
    // monitor and the position pass gets there first settles the trade
    h.paper.set_price("BTC-PERP", dec!(48750)).await;
    let mut actions = position_pass(&services, &DashSet::new()).await;
    if let Some((trade_id, decision)) = actions.pop() {
        assert_eq!(decision.exit_type, Some(ExitType::StopLoss));
        apply_decision(&services, trade_id, decision).await;
    }

    let mut closed = None;
    for _ in 0..200 {
        let t = h.store.get_trade(trade.trade_id).await.unwrap().unwrap();
        if t.status == TradeStatus::Closed {
            closed = Some(t);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    let closed = closed.expect("trade closed");
    assert!(closed.realized_pnl < Decimal::ZERO);
    assert!(!services.registry.contains("BTC-PERP").await);
    assert_eq!(services.risk.cached().await.consecutive_losses, 1);
}

#[tokio::test]
async fn entries_stop_at_end_of_day_cutoff() {
    let mut config = test_config();
    config.exits.end_of_day_exit = true;
    config.exits.end_of_day_cutoff = "00:00".to_string();
    let h = harness(config);
    let mut intake = SignalIntake::new(h.orchestrator.services());

    assert_eq!(intake.handle(btc_long()).await.unwrap_err(), Rejection::EndOfDay);
    assert_eq!(gate_calls(&h), 0);
    assert_eq!(h.paper.mutation_count(), 0);
    assert_eq!(
        h.orchestrator.services().metrics.signal_rejections("end_of_day"),
        1
    );
}
