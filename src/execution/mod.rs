//! Trade execution
//!
//! - `ExecutionEngine`: entries, exits, stop updates and reconciliation
//! - `TradeLedger`: write-through working set of active trades and orders
//! - `SymbolLocks`: per-symbol serialization of gate check and submission

mod engine;
mod ledger;
mod locks;

pub use engine::{ExecutionEngine, ReconcileReport, TradeRequest};
pub use ledger::TradeLedger;
pub use locks::SymbolLocks;
