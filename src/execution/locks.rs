use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per symbol.
///
/// Held across validate-then-submit so no other entry, exit or stop update
/// for the same symbol can interleave with a gate approval and its order.
/// Different symbols never contend.
#[derive(Debug, Clone, Default)]
pub struct SymbolLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl SymbolLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, symbol: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn lock(&self, symbol: &str) -> OwnedMutexGuard<()> {
        self.slot(symbol).lock_owned().await
    }

    pub fn try_lock(&self, symbol: &str) -> Option<OwnedMutexGuard<()>> {
        self.slot(symbol).try_lock_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_symbol_excludes_other_symbols_do_not() {
        let locks = SymbolLocks::new();
        let held = locks.lock("BTC-PERP").await;
        assert!(locks.try_lock("BTC-PERP").is_none());
        assert!(locks.try_lock("ETH-PERP").is_some());
        drop(held);
        assert!(locks.try_lock("BTC-PERP").is_some());
    }
}
