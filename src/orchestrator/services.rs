use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::AppConfig;
use crate::coordination::{EmergencyStopManager, ShutdownToken};
use crate::exchange::{ExchangeConnector, RetryPolicy};
use crate::execution::{ExecutionEngine, TradeLedger};
use crate::market::{MarketMonitor, PriceCache};
use crate::persistence::TradeStore;
use crate::position::{PositionLifecycleManager, PositionRegistry};
use crate::risk::{AuditLog, RiskGate, RiskStateManager};
use crate::services::{HealthState, Metrics};

/// Every long-lived service, built once at startup and shared by reference
/// with the loops, the admin handle and recovery.
pub struct Services {
    pub config: AppConfig,
    pub exchange: Arc<dyn ExchangeConnector>,
    pub store: Arc<dyn TradeStore>,
    pub retry: RetryPolicy,
    pub registry: PositionRegistry,
    pub prices: PriceCache,
    pub market: Arc<MarketMonitor>,
    pub audit: AuditLog,
    pub risk: Arc<RiskStateManager>,
    pub gate: Arc<RiskGate>,
    pub lifecycle: PositionLifecycleManager,
    pub engine: Arc<ExecutionEngine>,
    pub emergency: Arc<EmergencyStopManager>,
    pub metrics: Arc<Metrics>,
    pub health: Arc<HealthState>,
}

impl Services {
    pub fn build(
        config: AppConfig,
        exchange: Arc<dyn ExchangeConnector>,
        store: Arc<dyn TradeStore>,
        shutdown: ShutdownToken,
    ) -> Arc<Self> {
        let retry = RetryPolicy::from_config(&config.exchange);
        let registry = PositionRegistry::new();
        let audit = AuditLog::new(store.clone());
        let metrics = Arc::new(Metrics::new());

        let market = Arc::new(MarketMonitor::new(
            exchange.clone(),
            retry,
            config.risk.market_data_ttl_secs,
            config.orchestrator.candle_lookback,
            config.risk.depth_band_bps,
        ));
        let risk = Arc::new(RiskStateManager::new(
            Arc::new(RwLock::new(config.risk.clone())),
            exchange.clone(),
            registry.clone(),
            audit.clone(),
            retry,
        ));
        let gate = Arc::new(RiskGate::new(
            risk.clone(),
            registry.clone(),
            market.clone(),
            audit.clone(),
            metrics.clone(),
        ));
        let engine = Arc::new(ExecutionEngine::new(
            config.execution.clone(),
            exchange.clone(),
            gate.clone(),
            risk.clone(),
            registry.clone(),
            Arc::new(TradeLedger::new(store.clone())),
            audit.clone(),
            metrics.clone(),
            retry,
            shutdown,
        ));
        let emergency = Arc::new(EmergencyStopManager::new(
            engine.clone(),
            risk.clone(),
            audit.clone(),
        ));

        Arc::new(Self {
            lifecycle: PositionLifecycleManager::new(config.exits.clone()),
            health: Arc::new(HealthState::new(
                config.orchestrator.heartbeat_failure_threshold,
            )),
            config,
            exchange,
            store,
            retry,
            registry,
            prices: PriceCache::new(),
            market,
            audit,
            risk,
            gate,
            engine,
            emergency,
            metrics,
        })
    }
}
