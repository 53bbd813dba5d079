use chrono::NaiveTime;
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub exits: ExitConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub paper: PaperConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which connector variant backs the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    #[default]
    Paper,
    Gateway,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default)]
    pub kind: ConnectorKind,
    /// REST endpoint of the exchange gateway
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    /// Streaming endpoint of the exchange gateway
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Attempts for read calls (first try included)
    #[serde(default = "default_read_retry_attempts")]
    pub read_retry_attempts: u32,
    #[serde(default = "default_read_retry_backoff_ms")]
    pub read_retry_backoff_ms: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
}

fn default_rest_url() -> String {
    "http://127.0.0.1:8700".to_string()
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:8700/ws".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_read_retry_attempts() -> u32 {
    3
}

fn default_read_retry_backoff_ms() -> u64 {
    200
}

fn default_reconnect_base_ms() -> u64 {
    500
}

fn default_reconnect_max_secs() -> u64 {
    60
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            kind: ConnectorKind::Paper,
            rest_url: default_rest_url(),
            ws_url: default_ws_url(),
            api_key: None,
            api_secret: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            read_retry_attempts: default_read_retry_attempts(),
            read_retry_backoff_ms: default_read_retry_backoff_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_secs: default_reconnect_max_secs(),
        }
    }
}

/// Risk limits; adjustable at runtime through the admin handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Max realized daily loss as a fraction of portfolio value
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: Decimal,
    /// Max notional per symbol as a fraction of portfolio value
    #[serde(default = "default_max_position_size")]
    pub max_position_size: Decimal,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
    /// Peak-to-current equity decline allowed before new entries stop
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: Decimal,
    /// Aggregate notional across symbols as a fraction of portfolio value
    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure: Decimal,
    /// 0 = unlimited
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    #[serde(default = "default_min_account_balance")]
    pub min_account_balance: Decimal,
    #[serde(default = "default_max_volatility")]
    pub max_volatility: Decimal,
    #[serde(default = "default_max_spread_bps")]
    pub max_spread_bps: Decimal,
    #[serde(default = "default_min_depth_notional")]
    pub min_depth_notional: Decimal,
    #[serde(default = "default_depth_band_bps")]
    pub depth_band_bps: Decimal,
    /// Equity risked per trade when sizing from a stop distance
    #[serde(default = "default_max_portfolio_risk")]
    pub max_portfolio_risk: Decimal,
    /// Max age of cached RiskState before the gate refreshes it
    #[serde(default = "default_state_refresh_secs")]
    pub state_refresh_secs: u64,
    #[serde(default = "default_market_data_ttl_secs")]
    pub market_data_ttl_secs: u64,
}

fn default_max_daily_loss() -> Decimal {
    dec!(0.05)
}

fn default_max_position_size() -> Decimal {
    dec!(0.10)
}

fn default_max_consecutive_losses() -> u32 {
    4
}

fn default_breaker_cooldown_secs() -> u64 {
    3600
}

fn default_max_drawdown() -> Decimal {
    dec!(0.15)
}

fn default_max_total_exposure() -> Decimal {
    dec!(0.60)
}

fn default_max_open_positions() -> usize {
    5
}

fn default_min_account_balance() -> Decimal {
    dec!(100)
}

fn default_max_volatility() -> Decimal {
    dec!(0.05)
}

fn default_max_spread_bps() -> Decimal {
    dec!(50)
}

fn default_min_depth_notional() -> Decimal {
    dec!(10000)
}

fn default_depth_band_bps() -> Decimal {
    dec!(50)
}

fn default_max_portfolio_risk() -> Decimal {
    dec!(0.02)
}

fn default_state_refresh_secs() -> u64 {
    30
}

fn default_market_data_ttl_secs() -> u64 {
    60
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss: default_max_daily_loss(),
            max_position_size: default_max_position_size(),
            max_consecutive_losses: default_max_consecutive_losses(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
            max_drawdown: default_max_drawdown(),
            max_total_exposure: default_max_total_exposure(),
            max_open_positions: default_max_open_positions(),
            min_account_balance: default_min_account_balance(),
            max_volatility: default_max_volatility(),
            max_spread_bps: default_max_spread_bps(),
            min_depth_notional: default_min_depth_notional(),
            depth_band_bps: default_depth_band_bps(),
            max_portfolio_risk: default_max_portfolio_risk(),
            state_refresh_secs: default_state_refresh_secs(),
            market_data_ttl_secs: default_market_data_ttl_secs(),
        }
    }
}

impl RiskConfig {
    pub fn breaker_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.breaker_cooldown_secs as i64)
    }

    pub fn state_refresh(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.state_refresh_secs as i64)
    }
}

/// Partial-exit rung: take `fraction` of the position once profit reaches `profit_pct`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitLevel {
    pub profit_pct: Decimal,
    pub fraction: Decimal,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExitConfig {
    /// Hard loss floor as a fraction of entry, independent of the stop
    #[serde(default = "default_max_loss_pct")]
    pub max_loss_pct: Decimal,
    #[serde(default = "default_trailing_activation_pct")]
    pub trailing_activation_pct: Decimal,
    #[serde(default = "default_trailing_distance")]
    pub trailing_distance: Decimal,
    #[serde(default)]
    pub end_of_day_exit: bool,
    /// UTC cutoff, "HH:MM"
    #[serde(default = "default_end_of_day_cutoff")]
    pub end_of_day_cutoff: String,
    /// 0 disables the age check
    #[serde(default = "default_max_position_age_secs")]
    pub max_position_age_secs: u64,
    #[serde(default = "default_profit_levels")]
    pub profit_levels: Vec<ProfitLevel>,
    #[serde(default = "default_exit_volatility")]
    pub exit_volatility: Decimal,
    #[serde(default = "default_exit_max_spread_bps")]
    pub exit_max_spread_bps: Decimal,
    #[serde(default = "default_exit_min_depth_notional")]
    pub exit_min_depth_notional: Decimal,
}

fn default_max_loss_pct() -> Decimal {
    dec!(0.05)
}

fn default_trailing_activation_pct() -> Decimal {
    dec!(0.02)
}

fn default_trailing_distance() -> Decimal {
    dec!(0.01)
}

fn default_end_of_day_cutoff() -> String {
    "23:45".to_string()
}

fn default_max_position_age_secs() -> u64 {
    86_400
}

fn default_profit_levels() -> Vec<ProfitLevel> {
    vec![
        ProfitLevel {
            profit_pct: dec!(0.03),
            fraction: dec!(0.3),
        },
        ProfitLevel {
            profit_pct: dec!(0.06),
            fraction: dec!(0.3),
        },
    ]
}

fn default_exit_volatility() -> Decimal {
    dec!(0.10)
}

fn default_exit_max_spread_bps() -> Decimal {
    dec!(150)
}

fn default_exit_min_depth_notional() -> Decimal {
    dec!(2000)
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            max_loss_pct: default_max_loss_pct(),
            trailing_activation_pct: default_trailing_activation_pct(),
            trailing_distance: default_trailing_distance(),
            end_of_day_exit: false,
            end_of_day_cutoff: default_end_of_day_cutoff(),
            max_position_age_secs: default_max_position_age_secs(),
            profit_levels: default_profit_levels(),
            exit_volatility: default_exit_volatility(),
            exit_max_spread_bps: default_exit_max_spread_bps(),
            exit_min_depth_notional: default_exit_min_depth_notional(),
        }
    }
}

impl ExitConfig {
    pub fn end_of_day_cutoff_time(&self) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(&self.end_of_day_cutoff, "%H:%M").ok()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Entry fill wait before the attempt is abandoned
    #[serde(default = "default_fill_timeout_ms")]
    pub fill_timeout_ms: u64,
    /// Polling interval for order status in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Limit-exit wait before falling back to a market order
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    /// Price concession on limit exits (0.002 = 20 bps)
    #[serde(default = "default_exit_slippage")]
    pub exit_slippage: Decimal,
    #[serde(default = "default_leverage")]
    pub leverage: Decimal,
    /// OCO monitor polling interval
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
}

fn default_fill_timeout_ms() -> u64 {
    300_000
}

fn default_poll_interval() -> u64 {
    500
}

fn default_close_timeout_ms() -> u64 {
    30_000
}

fn default_exit_slippage() -> Decimal {
    dec!(0.002)
}

fn default_leverage() -> Decimal {
    Decimal::ONE
}

fn default_monitor_interval_ms() -> u64 {
    1_000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fill_timeout_ms: default_fill_timeout_ms(),
            poll_interval_ms: default_poll_interval(),
            close_timeout_ms: default_close_timeout_ms(),
            exit_slippage: default_exit_slippage(),
            leverage: default_leverage(),
            monitor_interval_ms: default_monitor_interval_ms(),
        }
    }
}

impl ExecutionConfig {
    pub fn fill_timeout(&self) -> Duration {
        Duration::from_millis(self.fill_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Symbols watched by market monitoring
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default = "default_market_interval_secs")]
    pub market_interval_secs: u64,
    #[serde(default = "default_position_interval_ms")]
    pub position_interval_ms: u64,
    #[serde(default = "default_risk_interval_secs")]
    pub risk_interval_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    /// Minimum gap between accepted signals on one symbol
    #[serde(default = "default_signal_cooldown_secs")]
    pub signal_cooldown_secs: u64,
    #[serde(default = "default_max_signals_per_hour")]
    pub max_signals_per_hour: usize,
    #[serde(default = "default_min_signal_confidence")]
    pub min_signal_confidence: Decimal,
    #[serde(default = "default_signal_queue_size")]
    pub signal_queue_size: usize,
    #[serde(default = "default_high_risk_score")]
    pub high_risk_score: Decimal,
    #[serde(default = "default_critical_risk_score")]
    pub critical_risk_score: Decimal,
    /// Distance from price used when tightening stops on losing positions
    #[serde(default = "default_tighten_stop_distance")]
    pub tighten_stop_distance: Decimal,
    /// Streamed price older than this falls back to a REST read
    #[serde(default = "default_price_staleness_secs")]
    pub price_staleness_secs: u64,
    #[serde(default = "default_candle_lookback")]
    pub candle_lookback: usize,
    #[serde(default)]
    pub close_on_shutdown: bool,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Consecutive failed heartbeats before the connector is reported unhealthy
    #[serde(default = "default_heartbeat_failure_threshold")]
    pub heartbeat_failure_threshold: u32,
}

fn default_symbols() -> Vec<String> {
    vec!["BTC-PERP".to_string(), "ETH-PERP".to_string()]
}

fn default_market_interval_secs() -> u64 {
    30
}

fn default_position_interval_ms() -> u64 {
    1_000
}

fn default_risk_interval_secs() -> u64 {
    10
}

fn default_health_interval_secs() -> u64 {
    15
}

fn default_signal_cooldown_secs() -> u64 {
    300
}

fn default_max_signals_per_hour() -> usize {
    10
}

fn default_min_signal_confidence() -> Decimal {
    dec!(0.5)
}

fn default_signal_queue_size() -> usize {
    256
}

fn default_high_risk_score() -> Decimal {
    dec!(0.6)
}

fn default_critical_risk_score() -> Decimal {
    dec!(0.85)
}

fn default_tighten_stop_distance() -> Decimal {
    dec!(0.005)
}

fn default_price_staleness_secs() -> u64 {
    5
}

fn default_candle_lookback() -> usize {
    60
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_heartbeat_failure_threshold() -> u32 {
    3
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            market_interval_secs: default_market_interval_secs(),
            position_interval_ms: default_position_interval_ms(),
            risk_interval_secs: default_risk_interval_secs(),
            health_interval_secs: default_health_interval_secs(),
            signal_cooldown_secs: default_signal_cooldown_secs(),
            max_signals_per_hour: default_max_signals_per_hour(),
            min_signal_confidence: default_min_signal_confidence(),
            signal_queue_size: default_signal_queue_size(),
            high_risk_score: default_high_risk_score(),
            critical_risk_score: default_critical_risk_score(),
            tighten_stop_distance: default_tighten_stop_distance(),
            price_staleness_secs: default_price_staleness_secs(),
            candle_lookback: default_candle_lookback(),
            close_on_shutdown: false,
            shutdown_grace_secs: default_shutdown_grace_secs(),
            heartbeat_failure_threshold: default_heartbeat_failure_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaperConfig {
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,
    /// Adverse price move applied to market fills
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: Decimal,
    #[serde(default = "default_half_spread_bps")]
    pub half_spread_bps: Decimal,
    /// Base size at each synthetic book level
    #[serde(default = "default_level_size")]
    pub level_size: Decimal,
    #[serde(default = "default_min_order_size")]
    pub min_order_size: Decimal,
    /// Seeded mid prices, e.g. { "BTC-PERP" = "50000" }
    #[serde(default)]
    pub prices: std::collections::HashMap<String, Decimal>,
}

fn default_initial_balance() -> Decimal {
    dec!(10000)
}

fn default_slippage_bps() -> Decimal {
    Decimal::ZERO
}

fn default_half_spread_bps() -> Decimal {
    dec!(1)
}

fn default_level_size() -> Decimal {
    dec!(5)
}

fn default_min_order_size() -> Decimal {
    dec!(0.001)
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_balance: default_initial_balance(),
            slippage_bps: default_slippage_bps(),
            half_spread_bps: default_half_spread_bps(),
            level_size: default_level_size(),
            min_order_size: default_min_order_size(),
            prices: std::collections::HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; in-memory storage when unset
    #[serde(default)]
    pub url: Option<String>,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl RiskConfig {
    /// Problems with the limits, one message per field; empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let unit = |v: Decimal| v > Decimal::ZERO && v <= Decimal::ONE;
        for (name, value) in [
            ("max_daily_loss", self.max_daily_loss),
            ("max_position_size", self.max_position_size),
            ("max_drawdown", self.max_drawdown),
            ("max_portfolio_risk", self.max_portfolio_risk),
        ] {
            if !unit(value) {
                errors.push(format!("{} must be in (0, 1], got {}", name, value));
            }
        }
        if self.max_total_exposure <= Decimal::ZERO {
            errors.push("max_total_exposure must be positive".to_string());
        }
        if self.max_position_size > self.max_total_exposure {
            errors.push("max_position_size cannot exceed max_total_exposure".to_string());
        }
        if self.max_consecutive_losses == 0 {
            errors.push("max_consecutive_losses must be at least 1".to_string());
        }
        if self.min_account_balance < Decimal::ZERO {
            errors.push("min_account_balance cannot be negative".to_string());
        }
        errors
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("PERPCTL_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // PERPCTL_RISK__MAX_DAILY_LOSS=0.03, PERPCTL_EXCHANGE__KIND=gateway, ...
            .add_source(
                Environment::with_prefix("PERPCTL")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Configuration used by tests and the CLI when no files are present
    pub fn default_config(paper: bool) -> Self {
        let mut cfg = Self::default();
        cfg.exchange.kind = if paper {
            ConnectorKind::Paper
        } else {
            ConnectorKind::Gateway
        };
        cfg
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let unit = |v: Decimal| v > Decimal::ZERO && v <= Decimal::ONE;

        errors.extend(self.risk.validate().into_iter().map(|e| format!("risk.{}", e)));
        for (name, value) in [
            ("exits.max_loss_pct", self.exits.max_loss_pct),
            ("exits.trailing_distance", self.exits.trailing_distance),
        ] {
            if !unit(value) {
                errors.push(format!("{} must be in (0, 1], got {}", name, value));
            }
        }

        let mut last_pct = Decimal::ZERO;
        let mut total_fraction = Decimal::ZERO;
        for (i, level) in self.exits.profit_levels.iter().enumerate() {
            if level.profit_pct <= last_pct {
                errors.push(format!(
                    "exits.profit_levels[{}] must be above the previous level",
                    i
                ));
            }
            if !unit(level.fraction) {
                errors.push(format!("exits.profit_levels[{}].fraction must be in (0, 1]", i));
            }
            last_pct = level.profit_pct;
            total_fraction += level.fraction;
        }
        if total_fraction > Decimal::ONE {
            errors.push("exits.profit_levels fractions sum above 1".to_string());
        }
        if self.exits.end_of_day_exit && self.exits.end_of_day_cutoff_time().is_none() {
            errors.push(format!(
                "exits.end_of_day_cutoff '{}' is not HH:MM",
                self.exits.end_of_day_cutoff
            ));
        }

        let orch = &self.orchestrator;
        if orch.high_risk_score >= orch.critical_risk_score {
            errors.push(
                "orchestrator.high_risk_score must be below critical_risk_score".to_string(),
            );
        }
        if orch.signal_queue_size == 0 {
            errors.push("orchestrator.signal_queue_size must be positive".to_string());
        }

        if self.execution.leverage < Decimal::ONE {
            errors.push("execution.leverage must be at least 1".to_string());
        }
        if self.execution.fill_timeout_ms == 0 {
            errors.push("execution.fill_timeout_ms must be positive".to_string());
        }

        if self.exchange.kind == ConnectorKind::Gateway
            && (self.exchange.api_key.is_none() || self.exchange.api_secret.is_none())
        {
            errors.push("exchange.api_key and exchange.api_secret are required for gateway".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = AppConfig::default_config(true);
        assert!(cfg.validate().is_ok(), "{:?}", cfg.validate());
        assert_eq!(cfg.execution.fill_timeout_ms, 300_000);
        assert_eq!(cfg.risk.max_consecutive_losses, 4);
    }

    #[test]
    fn test_gateway_requires_credentials() {
        let cfg = AppConfig::default_config(false);
        let errors = cfg.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("api_key")));
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        let mut cfg = AppConfig::default_config(true);
        cfg.orchestrator.high_risk_score = dec!(0.9);
        cfg.risk.max_daily_loss = dec!(1.5);
        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_load_from_missing_dir_uses_defaults() {
        let cfg = AppConfig::load_from("/nonexistent/perpctl-config").unwrap();
        assert_eq!(cfg.exchange.kind, ConnectorKind::Paper);
        assert_eq!(cfg.risk.max_daily_loss, dec!(0.05));
    }

    #[test]
    fn test_cutoff_parses() {
        let exits = ExitConfig::default();
        assert_eq!(
            exits.end_of_day_cutoff_time(),
            NaiveTime::from_hms_opt(23, 45, 0)
        );
    }
}
