pub mod market;
pub mod order;
pub mod position;
pub mod risk;
pub mod signal;
pub mod trade;

pub use market::{
    AccountBalance, BookLevel, Candle, ExchangePosition, MarketConditions, Orderbook, PublicTrade,
    Ticker,
};
pub use order::{
    CancelOutcome, Order, OrderAck, OrderRequest, OrderRole, OrderSide, OrderStatus,
    OrderStatusReport, OrderType,
};
pub use position::{Position, TrailingStop};
pub use risk::{
    DenyCode, PauseReason, PortfolioSnapshot, RiskDecision, RiskEvent, RiskEventType, RiskState,
};
pub use signal::TradingSignal;
pub use trade::{ExitType, Side, Trade, TradeStatus};
