use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::domain::DenyCode;

/// In-process counters; the health loop logs a summary line.
pub struct Metrics {
    pub gate_approved: AtomicU64,
    pub gate_denied: AtomicU64,
    gate_denials_by_code: DashMap<DenyCode, u64>,
    pub signals_received: AtomicU64,
    pub signals_accepted: AtomicU64,
    pub signals_rejected: AtomicU64,
    signal_rejections_by_reason: DashMap<String, u64>,
    pub orders_submitted: AtomicU64,
    pub orders_filled: AtomicU64,
    pub orders_failed: AtomicU64,
    pub trades_opened: AtomicU64,
    pub trades_closed: AtomicU64,
    pub trades_failed: AtomicU64,
    pub stream_reconnects: AtomicU64,
    pub stream_errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            gate_approved: AtomicU64::new(0),
            gate_denied: AtomicU64::new(0),
            gate_denials_by_code: DashMap::new(),
            signals_received: AtomicU64::new(0),
            signals_accepted: AtomicU64::new(0),
            signals_rejected: AtomicU64::new(0),
            signal_rejections_by_reason: DashMap::new(),
            orders_submitted: AtomicU64::new(0),
            orders_filled: AtomicU64::new(0),
            orders_failed: AtomicU64::new(0),
            trades_opened: AtomicU64::new(0),
            trades_closed: AtomicU64::new(0),
            trades_failed: AtomicU64::new(0),
            stream_reconnects: AtomicU64::new(0),
            stream_errors: AtomicU64::new(0),
        }
    }

    /// Record one gate verdict; denials are also counted per reason code.
    pub fn inc_gate_decision(&self, code: Option<DenyCode>) {
        match code {
            None => {
                self.gate_approved.fetch_add(1, Ordering::Relaxed);
            }
            Some(code) => {
                self.gate_denied.fetch_add(1, Ordering::Relaxed);
                *self.gate_denials_by_code.entry(code).or_insert(0) += 1;
            }
        }
    }

    pub fn gate_denials(&self, code: DenyCode) -> u64 {
        self.gate_denials_by_code.get(&code).map(|v| *v).unwrap_or(0)
    }

    pub fn inc_signals_received(&self) {
        self.signals_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_signal_accepted(&self) {
        self.signals_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_signal_rejected(&self, reason: &str) {
        self.signals_rejected.fetch_add(1, Ordering::Relaxed);
        *self
            .signal_rejections_by_reason
            .entry(reason.to_string())
            .or_insert(0) += 1;
    }

    pub fn signal_rejections(&self, reason: &str) -> u64 {
        self.signal_rejections_by_reason
            .get(reason)
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn inc_orders_submitted(&self) {
        self.orders_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_orders_filled(&self) {
        self.orders_filled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_orders_failed(&self) {
        self.orders_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_trades_opened(&self) {
        self.trades_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_trades_closed(&self) {
        self.trades_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_trades_failed(&self) {
        self.trades_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stream_reconnects(&self) {
        self.stream_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stream_errors(&self) {
        self.stream_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// One-line status for the health loop
    pub fn summary(&self) -> String {
        format!(
            "gate {}/{} (approved/denied) | signals {}/{}/{} (in/accepted/rejected) | orders {}/{}/{} (submitted/filled/failed) | trades {}/{}/{} (opened/closed/failed) | stream reconnects {} errors {}",
            self.gate_approved.load(Ordering::Relaxed),
            self.gate_denied.load(Ordering::Relaxed),
            self.signals_received.load(Ordering::Relaxed),
            self.signals_accepted.load(Ordering::Relaxed),
            self.signals_rejected.load(Ordering::Relaxed),
            self.orders_submitted.load(Ordering::Relaxed),
            self.orders_filled.load(Ordering::Relaxed),
            self.orders_failed.load(Ordering::Relaxed),
            self.trades_opened.load(Ordering::Relaxed),
            self.trades_closed.load(Ordering::Relaxed),
            self.trades_failed.load(Ordering::Relaxed),
            self.stream_reconnects.load(Ordering::Relaxed),
            self.stream_errors.load(Ordering::Relaxed),
        )
    }

    pub fn log_status(&self) {
        info!("{}", self.summary());
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_counters_by_code() {
        let m = Metrics::new();
        m.inc_gate_decision(None);
        m.inc_gate_decision(Some(DenyCode::DailyLoss));
        m.inc_gate_decision(Some(DenyCode::DailyLoss));
        assert_eq!(m.gate_approved.load(Ordering::Relaxed), 1);
        assert_eq!(m.gate_denied.load(Ordering::Relaxed), 2);
        assert_eq!(m.gate_denials(DenyCode::DailyLoss), 2);
        assert_eq!(m.gate_denials(DenyCode::MinimumBalance), 0);
    }

    #[test]
    fn test_signal_rejections_by_reason() {
        let m = Metrics::new();
        m.inc_signal_rejected("cooldown");
        m.inc_signal_rejected("position_open");
        m.inc_signal_rejected("cooldown");
        assert_eq!(m.signal_rejections("cooldown"), 2);
        assert!(m.summary().contains("signals 0/0/3"));
    }
}
