pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod market;
pub mod orchestrator;
pub mod persistence;
pub mod position;
pub mod risk;
pub mod services;

pub use config::AppConfig;
pub use coordination::{
    EmergencyReason, EmergencyStopManager, GracefulShutdown, ShutdownSignal, ShutdownToken,
};
pub use domain::{
    DenyCode, ExitType, Order, OrderStatus, Position, RiskEvent, RiskEventType, Side, Trade,
    TradeStatus, TradingSignal,
};
pub use error::{PerpError, Result};
pub use exchange::{ExchangeConnector, GatewayExchange, PaperExchange};
pub use execution::{ExecutionEngine, TradeRequest};
pub use orchestrator::{AdminHandle, Orchestrator, Services, SignalSender};
pub use persistence::{InMemoryStore, PostgresStore, TradeStore};
pub use position::{PositionLifecycleManager, PositionRegistry};
pub use risk::{RiskGate, RiskStateManager};
