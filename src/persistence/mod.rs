//! Durable state for crash recovery
//!
//! - `TradeStore`: trades, orders, position checkpoints and the risk-event audit log
//! - `InMemoryStore`: default backend for paper runs and tests
//! - `PostgresStore`: sqlx-backed production backend

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::TradeStore;

use std::sync::Arc;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::Result;

/// Open the configured store; falls back to memory when no URL is set.
pub async fn open_store(config: &DatabaseConfig) -> Result<Arc<dyn TradeStore>> {
    match &config.url {
        Some(url) => {
            let store = PostgresStore::new(url, config.max_connections).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        None => {
            info!("No database configured; state is kept in memory only");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}
