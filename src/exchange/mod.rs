mod gateway;
mod paper;
mod retry;
mod signing;
mod stream;
mod traits;

pub use gateway::GatewayExchange;
pub use paper::PaperExchange;
pub use retry::{retry_read, RetryPolicy};
pub use signing::RequestSigner;
pub use stream::MarketStream;
pub use traits::{ExchangeConnector, StreamCallback, StreamChannel, StreamEvent};

#[cfg(test)]
pub use traits::MockExchangeConnector;

use std::sync::Arc;
use tracing::info;

use crate::config::{AppConfig, ConnectorKind};
use crate::error::Result;

/// Build the connector selected by `exchange.kind`.
pub fn build_connector(config: &AppConfig) -> Result<Arc<dyn ExchangeConnector>> {
    let connector: Arc<dyn ExchangeConnector> = match config.exchange.kind {
        ConnectorKind::Paper => Arc::new(PaperExchange::new(config.paper.clone())),
        ConnectorKind::Gateway => Arc::new(GatewayExchange::new(&config.exchange)?),
    };
    info!(connector = connector.name(), "Exchange connector ready");
    Ok(connector)
}
