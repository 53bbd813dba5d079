mod conditions;
mod prices;

pub use conditions::{volatility, MarketMonitor};
pub use prices::PriceCache;
