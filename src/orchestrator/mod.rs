//! Orchestrator
//!
//! Owns the service graph and runs the five loops as independent tasks:
//!
//! - signal: drains the signal queue through admission control
//! - market: refreshes market conditions for watched symbols
//! - position: evaluates exit rules for every open position
//! - risk: recomputes account risk and escalates
//! - health: heartbeats the connector and logs status
//!
//! All loops observe one shutdown token. On shutdown the task handles are
//! drained, positions optionally closed, and the connector disconnected.

mod admin;
mod loops;
mod recovery;
mod services;
mod signal_intake;

pub use admin::{AdminHandle, AdminStatus, RiskLimitsUpdate};
pub use loops::{apply_decision, health_pass, market_pass, position_pass, risk_pass};
pub use recovery::{recover, RecoveryReport};
pub use services::Services;
pub use signal_intake::{Rejection, SignalIntake, SignalSender};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::coordination::{GracefulShutdown, ShutdownConfig, ShutdownSignal, ShutdownStep};
use crate::domain::TradingSignal;
use crate::error::Result;
use crate::exchange::{ExchangeConnector, StreamCallback, StreamEvent};
use crate::persistence::TradeStore;

pub struct Orchestrator {
    services: Arc<Services>,
    shutdown: Arc<GracefulShutdown>,
    signal_tx: mpsc::Sender<TradingSignal>,
    signal_rx: mpsc::Receiver<TradingSignal>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        exchange: Arc<dyn ExchangeConnector>,
        store: Arc<dyn TradeStore>,
    ) -> Self {
        let shutdown = Arc::new(GracefulShutdown::new(ShutdownConfig {
            grace_period: Duration::from_secs(config.orchestrator.shutdown_grace_secs),
            close_positions: config.orchestrator.close_on_shutdown,
        }));
        let (signal_tx, signal_rx) = mpsc::channel(config.orchestrator.signal_queue_size.max(1));
        let services = Services::build(config, exchange, store, shutdown.token());
        Self {
            services,
            shutdown,
            signal_tx,
            signal_rx,
        }
    }

    pub fn services(&self) -> Arc<Services> {
        self.services.clone()
    }

    pub fn shutdown_handle(&self) -> Arc<GracefulShutdown> {
        self.shutdown.clone()
    }

    pub fn signal_sender(&self) -> SignalSender {
        SignalSender::new(self.signal_tx.clone())
    }

    pub fn admin(&self) -> AdminHandle {
        AdminHandle::new(self.services.clone())
    }

    /// Recover, run every loop until shutdown is requested, then wind down.
    pub async fn run(self) -> Result<()> {
        let Self {
            services,
            shutdown,
            signal_tx,
            signal_rx,
        } = self;
        // held until return so intake ends on shutdown, not when external senders drop
        let _signal_tx = signal_tx;
        let mut requested = shutdown.subscribe();

        recover(&services).await?;
        subscribe_market_stream(&services).await;

        let mut tasks: Vec<(&'static str, tokio::task::JoinHandle<()>)> = Vec::new();
        tasks.push((
            "signal",
            tokio::spawn(SignalIntake::new(services.clone()).run(signal_rx, shutdown.token())),
        ));
        tasks.push((
            "market",
            tokio::spawn(loops::market_loop(services.clone(), shutdown.token())),
        ));
        tasks.push((
            "position",
            tokio::spawn(loops::position_loop(services.clone(), shutdown.token())),
        ));
        tasks.push((
            "risk",
            tokio::spawn(loops::risk_loop(services.clone(), shutdown.token())),
        ));
        tasks.push((
            "health",
            tokio::spawn(loops::health_loop(services.clone(), shutdown.token())),
        ));
        info!(
            symbols = ?services.config.orchestrator.symbols,
            exchange = services.exchange.name(),
            "orchestrator running"
        );

        let token = shutdown.token();
        token.cancelled().await;

        let signal = requested.try_recv().unwrap_or(ShutdownSignal::Graceful);

        let close_services = services.clone();
        let close_step: ShutdownStep = Box::pin(async move {
            let failures = close_services
                .engine
                .emergency_close_all("orchestrator shutdown")
                .await;
            if failures > 0 {
                error!(failures, "positions left open at shutdown");
            }
        });
        let disconnect_services = services.clone();
        let disconnect_step: ShutdownStep = Box::pin(async move {
            if let Err(e) = disconnect_services.exchange.disconnect().await {
                warn!(error = %e, "exchange disconnect failed");
            }
            disconnect_services.metrics.log_status();
        });

        if let Err(e) = shutdown
            .execute(signal, tasks, close_step, disconnect_step)
            .await
        {
            warn!(error = %e, "shutdown finished with errors");
        }
        Ok(())
    }
}

/// Subscribe tickers for the watched symbols; prices feed the position loop,
/// liveness feeds the health report. The loops fall back to REST without it.
async fn subscribe_market_stream(services: &Arc<Services>) {
    let symbols = services.config.orchestrator.symbols.clone();
    if symbols.is_empty() {
        return;
    }

    let prices = services.prices.clone();
    let health = services.health.clone();
    let metrics = services.metrics.clone();
    let callback: StreamCallback = Arc::new(move |event| match event {
        StreamEvent::Connected => health.set_stream_connected(true),
        StreamEvent::Disconnected { reason } => {
            health.set_stream_connected(false);
            metrics.inc_stream_reconnects();
            warn!(%reason, "market stream disconnected");
        }
        StreamEvent::Error(e) => {
            metrics.inc_stream_errors();
            warn!(error = %e, "market stream error");
        }
        StreamEvent::Ticker(ticker) => {
            prices.update_from_ticker(&ticker);
            health.record_stream_event();
        }
        StreamEvent::Orderbook(_) | StreamEvent::Trade(_) => health.record_stream_event(),
    });

    match services.exchange.subscribe_ticker(&symbols, callback).await {
        Ok(()) => {
            services.health.set_stream_subscribed(true);
            info!(count = symbols.len(), "market stream subscribed");
        }
        Err(e) => warn!(error = %e, "market stream unavailable; polling prices"),
    }
}
